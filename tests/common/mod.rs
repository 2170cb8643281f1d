//! Scripted fake host for pipeline tests.
//!
//! `FakeExecutor` plays apt, dpkg-query, depmod, update-initramfs, mksquashfs,
//! mtools and xorriso against a real temp directory. Its xorriso writes a tar
//! of the ISO tree, so tests can inspect the "image" with the `tar` crate.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;

use cyberxp_builder::buildroot::{MountSpec, Mounter, UnmountOutcome};
use cyberxp_builder::error::{BuildError, FailedAttempt, Result};
use cyberxp_builder::mirror::Fetcher;
use cyberxp_builder::preflight::HostProbe;
use cyberxp_builder::process::{Cmd, CommandResult, Executor};
use cyberxp_builder::{config, BuildContext, CancelToken};

pub const KERNEL: &str = "6.1.0-18-amd64";

/// Build config used by the pipeline tests, rooted in `dir`.
pub fn context(dir: &Path, mirrors: &[&str]) -> BuildContext {
    let mirrors = mirrors
        .iter()
        .map(|m| format!("\"{}\"", m))
        .collect::<Vec<_>>()
        .join(", ");
    let text = format!(
        r#"
[image]
name = "cyberxp-os"
version = "1.0.0"
output_dir = "out"
build_dir = "build"

[base]
distro = "debian"
release = "bookworm"
mirrors = [{mirrors}]

[packages]
essential = ["linux-image-amd64", "live-boot", "isolinux", "syslinux-common"]
optional = ["grub-efi-amd64-bin", "clamav"]
refresh_attempts = 1

[overlay]
app_dir = "dashboard"
services = ["ssh"]
"#
    );
    let app = dir.join("dashboard");
    fs::create_dir_all(app.join("static")).unwrap();
    fs::write(app.join("index.html"), "<h1>CyberXP</h1>").unwrap();
    fs::write(app.join("static/app.js"), "start()").unwrap();
    config::parse(&text, dir).unwrap()
}

/// Minimal Debian-like tree as a tar.gz.
pub fn base_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let files: &[(&str, &[u8], u32)] = &[
        ("usr/bin/dpkg", b"#!/bin/true\n", 0o755),
        ("usr/bin/apt-get", b"#!/bin/true\n", 0o755),
        ("bin/sh", b"#!/bin/true\n", 0o755),
        ("etc/os-release", b"ID=debian\nVERSION_CODENAME=bookworm\n", 0o644),
    ];
    for (path, content, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[derive(Default)]
pub struct FakeFetcher {
    pub archive: Vec<u8>,
    /// URLs that fail outright.
    pub failing: BTreeSet<String>,
    /// URLs that "succeed" but deliver nothing.
    pub empty: BTreeSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn serving(archive: Vec<u8>) -> Self {
        Self {
            archive,
            ..Default::default()
        }
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path, _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.contains(url) {
            return Err(BuildError::RetryableFetch {
                attempts: vec![FailedAttempt {
                    endpoint: url.to_string(),
                    reason: "connection refused".to_string(),
                }],
            });
        }
        let body: &[u8] = if self.empty.contains(url) {
            b""
        } else {
            &self.archive
        };
        fs::write(dest, body).map_err(|e| BuildError::io("writing", dest, e))
    }
}

/// Mounter that only records mount points.
#[derive(Default)]
pub struct RecordingMounter {
    active: Mutex<Vec<PathBuf>>,
    log: Mutex<Vec<String>>,
    /// Fail the n-th mount (0-based).
    pub fail_mount_at: Option<usize>,
    /// The first unmount of a target ending with this suffix fails.
    pub fail_unmount_once: Mutex<Option<String>>,
}

impl RecordingMounter {
    pub fn active(&self) -> Vec<PathBuf> {
        self.active.lock().unwrap().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Pretend an earlier run left `target` mounted.
    pub fn preload(&self, target: PathBuf) {
        self.active.lock().unwrap().push(target);
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, spec: &MountSpec) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        let count = self
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("mount "))
            .count();
        if self.fail_mount_at == Some(count) {
            return Err(BuildError::ToolInvocation {
                tool: "'mount'".into(),
                code: 32,
                stderr: "mount: permission denied".into(),
            });
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("mount {}", spec.target.display()));
        active.push(spec.target.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        let mut fail = self.fail_unmount_once.lock().unwrap();
        if let Some(suffix) = fail.as_deref() {
            if target.to_string_lossy().ends_with(suffix) {
                *fail = None;
                return Err(BuildError::ToolInvocation {
                    tool: "'umount'".into(),
                    code: 32,
                    stderr: "target is busy".into(),
                });
            }
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("umount {}", target.display()));
        self.active.lock().unwrap().retain(|t| t != target);
        Ok(UnmountOutcome::Clean)
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut found: Vec<PathBuf> = self
            .active
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.starts_with(root))
            .cloned()
            .collect();
        found.sort_by_key(|t| std::cmp::Reverse(t.components().count()));
        Ok(found)
    }
}

#[derive(Default)]
pub struct FakeProbe {
    pub missing_tools: Vec<String>,
}

impl HostProbe for FakeProbe {
    fn is_root(&self) -> bool {
        true
    }

    fn tool_exists(&self, tool: &str) -> bool {
        !self.missing_tools.iter().any(|t| t == tool)
    }

    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(1 << 40)
    }

    fn reachable(&self, _endpoint: &str, _timeout: Duration) -> bool {
        true
    }
}

/// Files a package drops into the rootfs when installed.
fn package_files(package: &str) -> Vec<(String, Vec<u8>)> {
    let files: Vec<(&str, &[u8])> = match package {
        "isolinux" => vec![
            ("usr/lib/ISOLINUX/isolinux.bin", b"isolinux"),
            ("usr/lib/ISOLINUX/isohdpfx.bin", b"mbr"),
        ],
        "syslinux-common" => vec![
            ("usr/lib/syslinux/modules/bios/ldlinux.c32", b"ldlinux"),
            ("usr/lib/syslinux/modules/bios/menu.c32", b"menu"),
            ("usr/lib/syslinux/modules/bios/libutil.c32", b"libutil"),
            ("usr/lib/syslinux/modules/bios/libcom32.c32", b"libcom32"),
        ],
        "grub-efi-amd64-bin" => vec![(
            "usr/lib/grub/x86_64-efi/monolithic/grubx64.efi",
            b"grub efi",
        )],
        _ => Vec::new(),
    };
    files
        .into_iter()
        .map(|(p, c)| (p.to_string(), c.to_vec()))
        .collect()
}

/// Scripted stand-in for every external tool the pipeline runs.
pub struct FakeExecutor {
    pub cancel: CancelToken,
    /// Kernel versions `linux-image-amd64` installs, with module dir mtimes.
    pub kernels: Vec<(String, u64)>,
    /// Packages apt cannot find.
    pub broken: BTreeSet<String>,
    /// Any command whose line contains this exits 1.
    pub fail_on: Option<String>,
    /// Any command whose line contains this cancels the run mid-tool.
    pub cancel_on: Option<String>,
    installed: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            kernels: vec![(KERNEL.to_string(), 1_700_000_000)],
            broken: BTreeSet::new(),
            fail_on: None,
            cancel_on: None,
            installed: Mutex::new(["apt", "dpkg", "base-files"].iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.calls().iter().any(|c| c.contains(needle))
    }

    fn apt_install(&self, root: &Path, packages: &[String]) -> CommandResult {
        if let Some(bad) = packages.iter().find(|p| self.broken.contains(*p)) {
            return CommandResult {
                code: 100,
                stdout: String::new(),
                stderr: format!("Reading package lists...\nE: Unable to locate package {}\n", bad),
            };
        }
        for package in packages {
            if package == "linux-image-amd64" {
                for (version, mtime) in &self.kernels {
                    let modules = root.join("lib/modules").join(version);
                    fs::create_dir_all(modules.join("kernel")).unwrap();
                    fs::write(
                        root.join("boot").join(format!("vmlinuz-{}", version)),
                        format!("kernel {}", version),
                    )
                    .unwrap();
                    File::open(&modules)
                        .unwrap()
                        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(*mtime))
                        .unwrap();
                }
            }
            for (rel, content) in package_files(package) {
                let path = root.join(rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, content).unwrap();
            }
            self.installed.lock().unwrap().insert(package.clone());
        }
        ok("")
    }

    fn in_root(&self, root: &Path, program: &str, args: &[String]) -> CommandResult {
        match program {
            "apt-get" if args.iter().any(|a| a == "install") => {
                let packages: Vec<String> = args
                    .iter()
                    .skip_while(|a| *a != "install")
                    .skip(1)
                    .filter(|a| !a.starts_with('-'))
                    .cloned()
                    .collect();
                fs::create_dir_all(root.join("boot")).unwrap();
                self.apt_install(root, &packages)
            }
            "apt-get" => ok(""),
            "dpkg-query" => {
                let listing: String = self
                    .installed
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|p| format!("{}\tinstall ok installed\n", p))
                    .collect();
                ok(&listing)
            }
            "depmod" => ok(""),
            "update-initramfs" => {
                let version = args.last().cloned().unwrap_or_default();
                fs::write(
                    root.join("boot").join(format!("initrd.img-{}", version)),
                    format!("initrd {}", version),
                )
                .unwrap();
                ok("")
            }
            other => failed(&format!("{}: command not found", other)),
        }
    }
}

fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandResult {
    CommandResult {
        code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Value following `flag` in `args`.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

impl Executor for FakeExecutor {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        self.cancel.check()?;
        let line = cmd.display_line();
        self.calls.lock().unwrap().push(line.clone());

        if let Some(needle) = &self.cancel_on {
            if line.contains(needle.as_str()) {
                self.cancel.cancel();
                return Err(BuildError::Interrupted);
            }
        }
        if let Some(needle) = &self.fail_on {
            if line.contains(needle.as_str()) {
                return Ok(failed("simulated failure"));
            }
        }

        let args = cmd.get_args();
        let result = match cmd.program() {
            "chroot" => {
                let root = PathBuf::from(&args[0]);
                self.in_root(&root, &args[1], &args[2..])
            }
            "mksquashfs" => {
                fs::write(&args[1], b"hsqs compressed rootfs").unwrap();
                ok("")
            }
            "dd" => {
                let of = args
                    .iter()
                    .find_map(|a| a.strip_prefix("of="))
                    .unwrap()
                    .to_string();
                fs::write(of, vec![0u8; 512]).unwrap();
                ok("")
            }
            "mkfs.fat" | "mmd" | "mcopy" => ok(""),
            "xorriso" => {
                let out = flag_value(args, "-o").unwrap().to_string();
                let tree = PathBuf::from(args.last().unwrap());
                let file = File::create(&out).unwrap();
                let mut builder = tar::Builder::new(file);
                builder.follow_symlinks(false);
                builder.append_dir_all(".", &tree).unwrap();
                builder.into_inner().unwrap();
                ok("")
            }
            other => failed(&format!("{}: not scripted", other)),
        };
        Ok(result)
    }
}

/// Regular files in the fake ISO (a tar), by path.
pub fn iso_members(iso: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(File::open(iso).unwrap());
    let mut members = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .unwrap()
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).unwrap();
        members.insert(name, buf);
    }
    members
}
