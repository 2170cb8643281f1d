//! Mount relations between host kernel interfaces and the build root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{BuildError, Result};
use crate::process::{Cmd, SystemExecutor};

const MOUNTINFO: &str = "/proc/self/mountinfo";
const UMOUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// One host resource attached inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Device, pseudo-filesystem name, or host path for binds.
    pub source: String,
    /// Absolute mount point.
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub bind: bool,
}

impl MountSpec {
    pub fn pseudo(fstype: &str, target: PathBuf) -> Self {
        Self {
            source: fstype.to_string(),
            target,
            fstype: Some(fstype.to_string()),
            bind: false,
        }
    }

    pub fn bind(source: &str, target: PathBuf) -> Self {
        Self {
            source: source.to_string(),
            target,
            fstype: None,
            bind: true,
        }
    }
}

/// How a mount was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Clean,
    /// Normal unmount failed; the kernel detached it lazily.
    Lazy,
}

/// Attaches and detaches mounts. Replaced by a recording fake in tests.
pub trait Mounter: Send + Sync {
    fn mount(&self, spec: &MountSpec) -> Result<()>;
    /// Normal unmount, escalating to a lazy one. `Err` only if both fail.
    fn unmount(&self, target: &Path) -> Result<UnmountOutcome>;
    /// Active mount points under `root`, deepest first.
    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

/// Mounter driving the host `mount`/`umount` tools.
///
/// Runs on its own never-cancelled executor: teardown has to work after
/// the operator has already pressed Ctrl-C.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    exec: SystemExecutor,
}

impl SystemMounter {
    pub fn new() -> Self {
        Self {
            exec: SystemExecutor::new(CancelToken::new()),
        }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec) -> Result<()> {
        let mut cmd = Cmd::new("mount");
        if spec.bind {
            cmd = cmd.arg("--bind");
        }
        if let Some(fstype) = &spec.fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        cmd.arg(&spec.source)
            .arg_path(&spec.target)
            .timeout(UMOUNT_TIMEOUT)
            .error_msg(format!("mount {}", spec.target.display()))
            .run(&self.exec)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        let normal = Cmd::new("umount")
            .arg_path(target)
            .timeout(UMOUNT_TIMEOUT)
            .allow_fail()
            .run(&self.exec)?;
        if normal.success() {
            return Ok(UnmountOutcome::Clean);
        }
        warn!(
            target = %target.display(),
            stderr = normal.stderr_trimmed(),
            "unmount failed, falling back to lazy unmount"
        );
        Cmd::new("umount")
            .arg("-l")
            .arg_path(target)
            .timeout(UMOUNT_TIMEOUT)
            .error_msg(format!("lazy unmount of {}", target.display()))
            .run(&self.exec)?;
        Ok(UnmountOutcome::Lazy)
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let text = fs::read_to_string(MOUNTINFO)
            .map_err(|e| BuildError::io("reading mount table", MOUNTINFO, e))?;
        // mountinfo lists resolved paths
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Ok(parse_mountinfo(&text, &root))
    }
}

/// Mount points at or below `root` from mountinfo text, deepest first.
pub fn parse_mountinfo(text: &str, root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = text
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .filter(|mount_point| mount_point.starts_with(root))
        .collect();
    found.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    found.dedup();
    debug!(root = %root.display(), count = found.len(), "mounts under root");
    found
}

/// Decode the `\040`-style octal escapes the kernel uses in mountinfo.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
40 22 0:5 / /build/rootfs/proc rw - proc proc rw
41 22 0:20 / /build/rootfs/sys rw - sysfs sysfs rw
42 22 0:6 / /build/rootfs/dev rw - devtmpfs udev rw
43 42 0:24 / /build/rootfs/dev/pts rw - devpts devpts rw
44 22 0:30 / /build/rootfs-other/proc rw - proc proc rw
45 22 0:31 / /build/root\\040fs/proc rw - proc proc rw
";

    #[test]
    fn finds_mounts_under_root_deepest_first() {
        let found = parse_mountinfo(SAMPLE, Path::new("/build/rootfs"));
        assert_eq!(found[0], PathBuf::from("/build/rootfs/dev/pts"));
        assert_eq!(found.len(), 4);
        assert!(!found.contains(&PathBuf::from("/build/rootfs-other/proc")));
    }

    #[test]
    fn decodes_escaped_spaces() {
        let found = parse_mountinfo(SAMPLE, Path::new("/build/root fs"));
        assert_eq!(found, vec![PathBuf::from("/build/root fs/proc")]);
    }
}
