//! Kernel discovery, initramfs regeneration and boot asset resolution.
//!
//! The kernel file name is only known after package installation, so the
//! assets are found by scanning the module directories and `boot/`. When
//! several kernels are present the most recently installed one (by module
//! directory mtime) is chosen.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{info, warn};

use crate::buildroot::BuildRoot;
use crate::cancel::CancelToken;
use crate::context::PackageManager;
use crate::error::{BuildError, Result};
use crate::process::Cmd;

const MODULE_DIRS: &[&str] = &["usr/lib/modules", "lib/modules"];
const KERNEL_PREFIXES: &[&str] = &["vmlinuz", "bzImage", "vmlinux"];
const INITRAMFS_PREFIXES: &[&str] = &["initrd.img", "initramfs"];

/// A kernel version with a module tree in the rootfs.
#[derive(Debug, Clone)]
pub struct KernelInstall {
    pub version: String,
    pub modules_dir: PathBuf,
    pub modified: SystemTime,
}

/// Resolved kernel and initramfs inside the rootfs.
#[derive(Debug, Clone, Serialize)]
pub struct BootAssets {
    pub kernel_version: String,
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
    /// Every version found, for the run summary.
    pub available_versions: Vec<String>,
}

/// Kernel versions under the module directories, de-duplicated by name.
pub fn find_kernel_versions(root: &Path) -> Result<Vec<KernelInstall>> {
    let mut found: Vec<KernelInstall> = Vec::new();
    for rel in MODULE_DIRS {
        let dir = root.join(rel);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let entry = entry.map_err(|e| BuildError::io("reading module dir", &dir, e))?;
            let path = entry.path();
            let meta = fs::metadata(&path).map_err(|e| BuildError::io("stat", &path, e))?;
            if !meta.is_dir() {
                continue;
            }
            let version = entry.file_name().to_string_lossy().into_owned();
            if found.iter().any(|k| k.version == version) {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|e| BuildError::io("reading mtime", &path, e))?;
            found.push(KernelInstall {
                version,
                modules_dir: path,
                modified,
            });
        }
    }
    found.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(found)
}

/// Most recently modified module tree; ties broken by name for determinism.
pub fn select_newest(kernels: &[KernelInstall]) -> Option<&KernelInstall> {
    kernels
        .iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.version.cmp(&b.version)))
}

/// Regenerate module indexes and initramfs for every kernel, then resolve
/// the assets of the newest one.
pub fn generate(
    root: &BuildRoot<'_>,
    manager: PackageManager,
    cancel: &CancelToken,
) -> Result<BootAssets> {
    // Capture mtimes before depmod touches every module directory.
    let kernels = find_kernel_versions(root.root())?;
    let chosen = select_newest(&kernels)
        .ok_or_else(|| {
            BuildError::Postcondition(format!(
                "no kernel installed: no module directories under {}/{{lib,usr/lib}}/modules",
                root.root().display()
            ))
        })?
        .clone();

    if kernels.len() > 1 {
        info!(
            versions = ?kernels.iter().map(|k| k.version.as_str()).collect::<Vec<_>>(),
            chosen = %chosen.version,
            "multiple kernels installed; selecting most recently installed"
        );
    }

    for kernel in &kernels {
        cancel.check()?;
        root.run(
            Cmd::new("depmod")
                .args(["-a", &kernel.version])
                .error_msg(format!("depmod {}", kernel.version)),
        )?;
        root.run(initramfs_cmd(root.root(), manager, &kernel.version))?;
        info!(version = %kernel.version, "initramfs regenerated");
    }

    let mut assets = resolve(root.root(), &chosen.version)?;
    assets.available_versions = kernels.into_iter().map(|k| k.version).collect();
    info!(
        kernel = %assets.kernel.display(),
        initramfs = %assets.initramfs.display(),
        version = %assets.kernel_version,
        "boot assets resolved"
    );
    Ok(assets)
}

fn initramfs_cmd(root: &Path, manager: PackageManager, version: &str) -> Cmd {
    let cmd = match manager {
        PackageManager::Apt => {
            let existing = root.join("boot").join(format!("initrd.img-{}", version));
            let mode = if existing.exists() { "-u" } else { "-c" };
            Cmd::new("update-initramfs").args([mode, "-k", version])
        }
        PackageManager::Apk => Cmd::new("mkinitfs").arg(version),
        PackageManager::Dnf => Cmd::new("dracut").args(["--force", "--kver", version]),
    };
    cmd.progress("initramfs")
}

/// Find the kernel and initramfs for `version` in `root/boot`.
///
/// Files naming `version` (directly or through a symlink) win. Distributions
/// that name them by flavor (`vmlinuz-lts`) fall back to the newest file
/// that carries no version at all; a file versioned for another kernel is
/// never used.
pub fn resolve(root: &Path, version: &str) -> Result<BootAssets> {
    let boot = root.join("boot");
    let kernel = pick(&boot, KERNEL_PREFIXES, version)?.ok_or_else(|| {
        BuildError::Postcondition(format!(
            "kernel image for {} not found in {}",
            version,
            boot.display()
        ))
    })?;
    let initramfs = pick(&boot, INITRAMFS_PREFIXES, version)?.ok_or_else(|| {
        BuildError::Postcondition(format!(
            "initramfs for {} not found in {}",
            version,
            boot.display()
        ))
    })?;
    Ok(BootAssets {
        kernel_version: version.to_string(),
        kernel,
        initramfs,
        available_versions: vec![version.to_string()],
    })
}

struct BootFile {
    path: PathBuf,
    /// Own name, then the symlink target's name if it differs.
    names: Vec<String>,
    modified: SystemTime,
}

fn pick(boot: &Path, prefixes: &[&str], version: &str) -> Result<Option<PathBuf>> {
    let Ok(entries) = fs::read_dir(boot) else {
        return Ok(None);
    };
    let mut candidates: Vec<BootFile> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io("reading", boot, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !prefixes.iter().any(|p| name.starts_with(p)) || name.ends_with(".old") {
            continue;
        }
        let path = entry.path();
        // Follow symlinks like vmlinuz -> vmlinuz-6.1.0-18-amd64; skip dangling ones.
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let mut names = vec![name];
        if let Some(target) = fs::canonicalize(&path)
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()))
        {
            if target != names[0] {
                names.push(target);
            }
        }
        candidates.push(BootFile {
            path,
            names,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    // A real versioned file beats a symlink to it.
    for depth in [1, 2] {
        if let Some(file) = candidates.iter().find(|f| {
            f.names
                .iter()
                .take(depth)
                .any(|n| names_version(n, prefixes, version))
        }) {
            return Ok(Some(file.path.clone()));
        }
    }

    let (unversioned, foreign): (Vec<BootFile>, Vec<BootFile>) = candidates
        .into_iter()
        .partition(|f| !f.names.iter().any(|n| carries_version(n, prefixes)));
    if unversioned.is_empty() {
        if let Some(file) = foreign.first() {
            return Err(BuildError::Postcondition(format!(
                "no boot file for kernel {} in {}; {} belongs to a different kernel",
                version,
                boot.display(),
                file.path.display()
            )));
        }
        return Ok(None);
    }
    warn!(version, dir = %boot.display(), "no boot file names the kernel version; using newest unversioned candidate");
    Ok(unversioned
        .into_iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)))
        .map(|f| f.path))
}

/// `vmlinuz-6.1...` or `initramfs-6.6...img`, as opposed to `vmlinuz-lts`.
fn carries_version(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// `vmlinuz-<ver>`, `initrd.img-<ver>`, `initramfs-<ver>.img`, but not `<ver>0`.
fn names_version(name: &str, prefixes: &[&str], version: &str) -> bool {
    prefixes.iter().any(|prefix| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_prefix(version))
            .map(|tail| tail.is_empty() || tail.starts_with('.'))
            .unwrap_or(false)
    })
}
