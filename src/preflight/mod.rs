//! Host checks run once before any stage that could leave partial state.
//!
//! Catches the common failure modes (not root, missing tools, full disk,
//! no route to any mirror) before there is anything to clean up.

mod types;

pub use types::{CheckResult, CheckStatus, PreflightReport};

use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::{BaseSource, BootstrapTool, BuildContext, CompressionFormat};
use crate::error::{BuildError, Result};
use crate::process;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Facts about the build host. Replaced by fakes in tests.
pub trait HostProbe: Send + Sync {
    fn is_root(&self) -> bool;
    fn tool_exists(&self, tool: &str) -> bool;
    /// Free bytes on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
    /// Whether a TCP connection to the endpoint's host can be opened.
    fn reachable(&self, endpoint: &str, timeout: Duration) -> bool;
}

/// Probe backed by the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn is_root(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn tool_exists(&self, tool: &str) -> bool {
        process::exists(tool)
    }

    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(existing_ancestor(path))
    }

    fn reachable(&self, endpoint: &str, timeout: Duration) -> bool {
        let Ok(url) = reqwest::Url::parse(endpoint) else {
            return false;
        };
        let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
            return false;
        };
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
    }
}

/// Host tools the configured build needs, as (command, package).
pub fn required_tools(ctx: &BuildContext) -> Vec<(&'static str, &'static str)> {
    let mut tools = vec![
        ("mount", "util-linux"),
        ("umount", "util-linux"),
        ("chroot", "coreutils"),
        ("dd", "coreutils"),
        ("xorriso", "xorriso"),
        ("mkfs.fat", "dosfstools"),
        ("mmd", "mtools"),
        ("mcopy", "mtools"),
    ];
    tools.push(match ctx.compression.format {
        CompressionFormat::Squashfs => ("mksquashfs", "squashfs-tools"),
        CompressionFormat::Erofs => ("mkfs.erofs", "erofs-utils"),
    });
    if let BaseSource::Bootstrap { tool, .. } = &ctx.base {
        tools.push(match tool {
            BootstrapTool::Debootstrap => ("debootstrap", "debootstrap"),
            BootstrapTool::Apk => ("apk", "apk-tools-static"),
            BootstrapTool::Dnf => ("dnf", "dnf"),
        });
    }
    tools
}

/// Run every check and collect the results without failing.
pub fn run_checks(ctx: &BuildContext, probe: &dyn HostProbe) -> PreflightReport {
    let mut report = PreflightReport::default();

    if ctx.preflight.require_root {
        if probe.is_root() {
            report.checks.push(CheckResult::pass("privilege"));
        } else {
            report.checks.push(CheckResult::fail(
                "privilege",
                "must run as root (mounts and chroot need CAP_SYS_ADMIN)",
            ));
        }
    } else {
        report
            .checks
            .push(CheckResult::skip("privilege", "require_root = false"));
    }

    for (tool, package) in required_tools(ctx) {
        let name = format!("tool {}", tool);
        if probe.tool_exists(tool) {
            report.checks.push(CheckResult::pass(&name));
        } else {
            report
                .checks
                .push(CheckResult::fail(&name, &format!("install: {}", package)));
        }
    }

    report.checks.push(check_space(
        probe,
        "build dir space",
        &ctx.build_dir,
        ctx.preflight.min_free_bytes,
    ));

    if ctx.preflight.check_network {
        report.checks.push(check_network(probe, &ctx.mirrors));
    } else {
        report
            .checks
            .push(CheckResult::skip("network", "check_network = false"));
    }

    report
}

/// Run every check and fail with [`BuildError::Precondition`] if any failed.
pub fn verify(ctx: &BuildContext, probe: &dyn HostProbe) -> Result<PreflightReport> {
    let report = run_checks(ctx, probe);
    report.log();
    if !report.all_passed() {
        return Err(BuildError::Precondition(report.failures().join("; ")));
    }
    Ok(report)
}

fn check_space(probe: &dyn HostProbe, name: &str, path: &Path, required: u64) -> CheckResult {
    match probe.available_space(path) {
        Ok(available) if available >= required => CheckResult::pass_with(
            name,
            &format!("{:.1} GB free", available as f64 / GIB),
        ),
        Ok(available) => CheckResult::fail(
            name,
            &format!(
                "{}: required {:.1} GB, available {:.1} GB",
                path.display(),
                required as f64 / GIB,
                available as f64 / GIB
            ),
        ),
        Err(e) => CheckResult::warn(
            name,
            &format!(
                "could not determine free space for {} ({}); ensure {:.1} GB is available",
                path.display(),
                e,
                required as f64 / GIB
            ),
        ),
    }
}

fn check_network(probe: &dyn HostProbe, mirrors: &[String]) -> CheckResult {
    match mirrors
        .iter()
        .find(|m| probe.reachable(m, PROBE_TIMEOUT))
    {
        Some(mirror) => CheckResult::pass_with("network", mirror),
        None => CheckResult::fail(
            "network",
            &format!("none of {} mirror(s) reachable", mirrors.len()),
        ),
    }
}

/// The path itself or its nearest existing parent.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("/"),
        }
    }
}
