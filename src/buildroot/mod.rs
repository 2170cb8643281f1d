//! Isolated build root.
//!
//! [`BuildRoot`] attaches `/proc`, `/sys`, `/dev` and `/dev/pts` inside the
//! acquired rootfs, installs a working resolv.conf, and runs commands with
//! the rootfs as their `/`. It is the single owner of those mounts: they are
//! released in reverse creation order by [`BuildRoot::teardown`], or by `Drop`
//! if the handle goes out of scope on an error path.

pub mod mount;

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::context::PackageManager;
use crate::error::{BuildError, Result};
use crate::process::{Cmd, CommandResult, Executor};

pub use mount::{MountSpec, Mounter, SystemMounter, UnmountOutcome};

pub const HOST_RESOLV: &str = "/etc/resolv.conf";
const FALLBACK_NAMESERVERS: &str = "nameserver 1.1.1.1\nnameserver 9.9.9.9\n";
const RESOLV_BACKUP: &str = "etc/resolv.conf.cyberxp-orig";
const POLICY_RC: &str = "usr/sbin/policy-rc.d";
const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What the root's resolv.conf was before we replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginalResolv {
    Absent,
    /// Regular file, moved aside to [`RESOLV_BACKUP`].
    File,
    Symlink(PathBuf),
}

/// Result of releasing a build root.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub unmounted: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Active build root. Mounts live exactly as long as this handle.
pub struct BuildRoot<'a> {
    root: PathBuf,
    exec: &'a dyn Executor,
    mounter: &'a dyn Mounter,
    /// Mount points in creation order.
    active: Vec<PathBuf>,
    resolv: Option<OriginalResolv>,
    policy_rc: Option<PathBuf>,
    released: bool,
}

impl<'a> BuildRoot<'a> {
    /// Mount host interfaces into `root` and prepare it for package work.
    ///
    /// On failure everything attached so far is released before returning.
    pub fn activate(
        root: &Path,
        manager: PackageManager,
        exec: &'a dyn Executor,
        mounter: &'a dyn Mounter,
    ) -> Result<Self> {
        Self::activate_with_resolv(root, manager, Path::new(HOST_RESOLV), exec, mounter)
    }

    pub fn activate_with_resolv(
        root: &Path,
        manager: PackageManager,
        host_resolv: &Path,
        exec: &'a dyn Executor,
        mounter: &'a dyn Mounter,
    ) -> Result<Self> {
        let mut build_root = BuildRoot {
            root: root.to_path_buf(),
            exec,
            mounter,
            active: Vec::new(),
            resolv: None,
            policy_rc: None,
            released: false,
        };

        // Dropping `build_root` on `?` releases partial state.
        for spec in standard_mounts(root) {
            fs::create_dir_all(&spec.target)
                .map_err(|e| BuildError::io("creating mount point", &spec.target, e))?;
            mounter.mount(&spec)?;
            info!(target = %spec.target.display(), source = %spec.source, "mounted");
            build_root.active.push(spec.target);
        }

        // Recorded before the replacement is written so a failed write still restores.
        build_root.resolv = Some(set_aside_resolv(root)?);
        write_resolv(root, host_resolv)?;

        if manager == PackageManager::Apt {
            build_root.policy_rc = install_policy_rc(root)?;
        }

        Ok(build_root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount points currently held, in creation order.
    pub fn active_mounts(&self) -> &[PathBuf] {
        &self.active
    }

    /// Run `cmd` with the rootfs as `/`. A non-zero exit is returned, not raised.
    pub fn execute(&self, cmd: Cmd) -> Result<CommandResult> {
        self.exec.execute(&self.wrap(cmd))
    }

    /// Run `cmd` with the rootfs as `/`, failing on a non-zero exit.
    pub fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        self.wrap(cmd).run(self.exec)
    }

    fn wrap(&self, cmd: Cmd) -> Cmd {
        cmd.env("PATH", CHROOT_PATH)
            .env("LC_ALL", "C")
            .chrooted(&self.root)
    }

    /// Release everything in reverse order.
    ///
    /// A mount that needed a lazy unmount is reported as a warning. A mount
    /// that could not be released at all makes this an error.
    pub fn teardown(mut self) -> Result<TeardownReport> {
        self.release()
    }

    fn release(&mut self) -> Result<TeardownReport> {
        if self.released {
            return Ok(TeardownReport::default());
        }
        self.released = true;

        let mut report = TeardownReport::default();
        let mut failures = Vec::new();

        if let Some(path) = self.policy_rc.take() {
            if let Err(e) = fs::remove_file(&path) {
                failures.push(format!("removing {}: {}", path.display(), e));
            }
        }

        if let Some(original) = self.resolv.take() {
            if let Err(e) = restore_resolv(&self.root, &original) {
                failures.push(e.to_string());
            }
        }

        while let Some(target) = self.active.pop() {
            match self.mounter.unmount(&target) {
                Ok(UnmountOutcome::Clean) => {
                    info!(target = %target.display(), "unmounted");
                    report.unmounted.push(target);
                }
                Ok(UnmountOutcome::Lazy) => {
                    let msg = format!("{} required a lazy unmount", target.display());
                    warn!("{}", msg);
                    report.warnings.push(msg);
                    report.unmounted.push(target);
                }
                Err(e) => {
                    error!(target = %target.display(), error = %e, "unmount failed");
                    failures.push(format!("{}: {}", target.display(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(BuildError::Postcondition(format!(
                "build root teardown incomplete: {}",
                failures.join("; ")
            )))
        }
    }
}

impl Drop for BuildRoot<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(root = %self.root.display(), "build root dropped without explicit teardown");
        if let Err(e) = self.release() {
            error!(error = %e, "teardown on drop failed; mounts may remain");
        }
    }
}

/// Mounts in creation order: proc, sys, dev, dev/pts.
pub fn standard_mounts(root: &Path) -> Vec<MountSpec> {
    vec![
        MountSpec::pseudo("proc", root.join("proc")),
        MountSpec::bind("/sys", root.join("sys")),
        MountSpec::bind("/dev", root.join("dev")),
        MountSpec::bind("/dev/pts", root.join("dev/pts")),
    ]
}

/// Unmount anything a killed earlier run left attached under `root`.
pub fn sweep_stale_mounts(root: &Path, mounter: &dyn Mounter) -> Result<Vec<PathBuf>> {
    let stale = mounter.mounts_under(root)?;
    for target in &stale {
        warn!(target = %target.display(), "unmounting stale mount from a previous run");
        mounter.unmount(target)?;
    }
    Ok(stale)
}

/// Move the root's own resolv.conf out of the way and say what it was.
fn set_aside_resolv(root: &Path) -> Result<OriginalResolv> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc).map_err(|e| BuildError::io("creating", &etc, e))?;
    let target = etc.join("resolv.conf");

    match fs::symlink_metadata(&target) {
        Err(_) => Ok(OriginalResolv::Absent),
        Ok(meta) if meta.file_type().is_symlink() => {
            let link = fs::read_link(&target)
                .map_err(|e| BuildError::io("reading symlink", &target, e))?;
            fs::remove_file(&target).map_err(|e| BuildError::io("removing", &target, e))?;
            Ok(OriginalResolv::Symlink(link))
        }
        Ok(_) => {
            let backup = root.join(RESOLV_BACKUP);
            fs::rename(&target, &backup).map_err(|e| BuildError::io("backing up", &target, e))?;
            Ok(OriginalResolv::File)
        }
    }
}

/// Host name servers, or the fallback list if the host has none.
fn write_resolv(root: &Path, host_resolv: &Path) -> Result<()> {
    let target = root.join("etc/resolv.conf");
    let contents = match fs::read_to_string(host_resolv) {
        Ok(text) if text.lines().any(|l| l.trim_start().starts_with("nameserver")) => text,
        _ => {
            warn!(
                host = %host_resolv.display(),
                "host resolv.conf missing or has no nameserver; using fallback list"
            );
            FALLBACK_NAMESERVERS.to_string()
        }
    };
    fs::write(&target, contents).map_err(|e| BuildError::io("writing", &target, e))
}

fn restore_resolv(root: &Path, original: &OriginalResolv) -> Result<()> {
    let target = root.join("etc/resolv.conf");
    if fs::symlink_metadata(&target).is_ok() {
        fs::remove_file(&target).map_err(|e| BuildError::io("removing", &target, e))?;
    }
    match original {
        OriginalResolv::Absent => {}
        OriginalResolv::File => {
            let backup = root.join(RESOLV_BACKUP);
            fs::rename(&backup, &target).map_err(|e| BuildError::io("restoring", &backup, e))?;
        }
        OriginalResolv::Symlink(link) => {
            symlink(link, &target).map_err(|e| BuildError::io("restoring symlink", &target, e))?;
        }
    }
    Ok(())
}

/// Stop maintainer scripts from starting daemons inside the root.
/// Returns the path only if we created it.
fn install_policy_rc(root: &Path) -> Result<Option<PathBuf>> {
    let path = root.join(POLICY_RC);
    if fs::symlink_metadata(&path).is_ok() {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating", parent, e))?;
    }
    fs::write(&path, "#!/bin/sh\nexit 101\n").map_err(|e| BuildError::io("writing", &path, e))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .map_err(|e| BuildError::io("chmod", &path, e))?;
    Ok(Some(path))
}
