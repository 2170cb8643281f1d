//! Base root filesystem acquisition.
//!
//! Two strategies: fetch and unpack a pre-built minimal archive, or run a
//! bootstrap tool against a package repository. Either way the result must
//! contain a package-manager binary and a shell, checked on disk.

pub mod archive;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::buildroot::Mounter;
use crate::cancel::CancelToken;
use crate::context::{BaseSource, BootstrapTool, BuildContext, PackageManager};
use crate::error::{BuildError, FailedAttempt, Result};
use crate::mirror::{Fetcher, MirrorResolver};
use crate::process::{Cmd, Executor};

/// Written next to (not inside) the rootfs after a verified acquisition.
pub const ACQUISITION_MARKER: &str = ".rootfs-key";

const ARCHIVE_NAME: &str = "base-rootfs.archive";

/// Outcome of the acquisition stage.
#[derive(Debug, Clone)]
pub struct AcquiredRoot {
    pub rootfs: PathBuf,
    /// Endpoint that produced the tree; `None` when reused from cache.
    pub endpoint: Option<String>,
    pub failed_attempts: Vec<FailedAttempt>,
    pub from_cache: bool,
}

/// Materialize the base rootfs for `ctx` under its build directory.
pub fn acquire(
    ctx: &BuildContext,
    exec: &dyn Executor,
    fetcher: &dyn Fetcher,
    mounter: &dyn Mounter,
    cancel: &CancelToken,
) -> Result<AcquiredRoot> {
    let layout = ctx.layout();
    let marker = layout.root.join(ACQUISITION_MARKER);

    if ctx.keep_build_dir
        && cache_matches(&marker, ctx)
        && verify_minimal_root(&layout.rootfs, ctx.packages.manager).is_ok()
    {
        info!(rootfs = %layout.rootfs.display(), "reusing cached rootfs");
        return Ok(AcquiredRoot {
            rootfs: layout.rootfs,
            endpoint: None,
            failed_attempts: Vec::new(),
            from_cache: true,
        });
    }

    let _ = fs::remove_file(&marker);
    remove_stale_rootfs(&layout.rootfs, mounter)?;

    let resolver = MirrorResolver::new(&ctx.mirrors, ctx.fetch_timeout, cancel)
        .attempts_per_endpoint(ctx.attempts_per_mirror, std::time::Duration::from_secs(2));

    let resolved = match &ctx.base {
        BaseSource::Archive => {
            fs::create_dir_all(&layout.downloads)
                .map_err(|e| BuildError::io("creating downloads dir", &layout.downloads, e))?;
            let download = layout.downloads.join(ARCHIVE_NAME);
            let resolved = resolver.resolve(&download, |endpoint, dest, timeout| {
                fetcher.fetch(endpoint, dest, timeout)
            })?;
            info!(endpoint = %resolved.endpoint, "unpacking base archive");
            archive::unpack(&download, &layout.rootfs)?;
            let _ = fs::remove_file(&download);
            resolved
        }
        BaseSource::Bootstrap { tool, suite } => {
            resolver.resolve(&layout.rootfs, |endpoint, dest, _| {
                bootstrap_command(ctx, *tool, suite, endpoint, dest).run(exec)?;
                Ok(())
            })?
        }
    };

    verify_minimal_root(&layout.rootfs, ctx.packages.manager)?;
    fs::write(&marker, ctx.acquisition_key())
        .map_err(|e| BuildError::io("writing acquisition marker", &marker, e))?;

    info!(
        endpoint = %resolved.endpoint,
        failed_attempts = resolved.failed.len(),
        strategy = ctx.base.label(),
        "base rootfs acquired"
    );
    Ok(AcquiredRoot {
        rootfs: layout.rootfs,
        endpoint: Some(resolved.endpoint),
        failed_attempts: resolved.failed,
        from_cache: false,
    })
}

/// Delete a previous rootfs, unless anything is still mounted inside it.
fn remove_stale_rootfs(rootfs: &Path, mounter: &dyn Mounter) -> Result<()> {
    if !rootfs.exists() {
        return Ok(());
    }
    let mounted = mounter.mounts_under(rootfs)?;
    if let Some(first) = mounted.first() {
        return Err(BuildError::Precondition(format!(
            "refusing to remove {}: {} mount(s) still active under it, starting with {}",
            rootfs.display(),
            mounted.len(),
            first.display()
        )));
    }
    fs::remove_dir_all(rootfs).map_err(|e| BuildError::io("removing stale rootfs", rootfs, e))
}

/// Command line for one bootstrap attempt against `mirror`.
pub fn bootstrap_command(
    ctx: &BuildContext,
    tool: BootstrapTool,
    suite: &str,
    mirror: &str,
    target: &Path,
) -> Cmd {
    let mirror = mirror.trim_end_matches('/');
    let cmd = match tool {
        BootstrapTool::Debootstrap => Cmd::new("debootstrap")
            .arg("--variant=minbase")
            .arg(format!("--arch={}", debian_arch(&ctx.arch)))
            .arg(suite)
            .arg_path(target)
            .arg(mirror),
        BootstrapTool::Apk => Cmd::new("apk")
            .args(["--arch", &ctx.arch])
            .arg("-X")
            .arg(format!("{}/v{}/main", mirror, suite.trim_start_matches('v')))
            .args(["-U", "--allow-untrusted", "--initdb", "--root"])
            .arg_path(target)
            .args(["add", "alpine-base", "apk-tools"]),
        BootstrapTool::Dnf => Cmd::new("dnf")
            .args(["-y", "--nogpgcheck"])
            .arg(format!("--installroot={}", target.display()))
            .arg(format!("--releasever={}", suite))
            .arg(format!("--repofrompath=cyberxp-base,{}", mirror))
            .args(["--repo=cyberxp-base", "--setopt=install_weak_deps=False"])
            .args(["install", "dnf", "bash", "coreutils"]),
    };
    cmd.timeout(ctx.packages.install_timeout)
        .error_msg(format!("bootstrap ({})", tool.host_binary()))
        .progress("bootstrap")
}

/// Package-manager binary and shell must exist in the tree.
pub fn verify_minimal_root(rootfs: &Path, manager: PackageManager) -> Result<()> {
    let manager_candidates: &[&str] = match manager {
        PackageManager::Apt => &["usr/bin/apt-get", "usr/bin/dpkg"],
        PackageManager::Apk => &["sbin/apk", "usr/sbin/apk", "usr/bin/apk"],
        PackageManager::Dnf => &["usr/bin/dnf", "usr/bin/dnf5", "usr/bin/dnf-3"],
    };
    let shell_candidates = ["bin/sh", "usr/bin/sh", "bin/bash", "usr/bin/bash"];

    let mut missing = Vec::new();
    if find_in_root(rootfs, manager_candidates).is_none() {
        missing.push(format!("{} binary ({})", manager, manager_candidates.join(" | ")));
    }
    if find_in_root(rootfs, &shell_candidates).is_none() {
        missing.push("shell (bin/sh)".to_string());
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BuildError::Postcondition(format!(
            "acquired rootfs at {} lacks {}",
            rootfs.display(),
            missing.join(", ")
        )))
    }
}

/// First candidate present in the tree. Symlinks count even when dangling
/// on the host, since their targets resolve inside the root.
pub fn find_in_root<'a>(rootfs: &Path, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .find(|rel| fs::symlink_metadata(rootfs.join(rel)).is_ok())
}

fn cache_matches(marker: &Path, ctx: &BuildContext) -> bool {
    match fs::read_to_string(marker) {
        Ok(key) if key.trim() == ctx.acquisition_key() => true,
        Ok(_) => {
            warn!("cached rootfs was built from different inputs; re-acquiring");
            false
        }
        Err(_) => false,
    }
}

fn debian_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "i686" | "i386" => "i386",
        other => other,
    }
}
