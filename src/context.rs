//! Immutable configuration for one pipeline run.
//!
//! A [`BuildContext`] is produced once by [`crate::config`] and handed to every
//! stage by shared reference. Nothing in the pipeline mutates it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// How the base root filesystem is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// Fetch a pre-built minimal rootfs archive from the mirror list and unpack it.
    Archive,
    /// Run a bootstrap tool against each repository mirror until one succeeds.
    Bootstrap { tool: BootstrapTool, suite: String },
}

impl BaseSource {
    pub fn label(&self) -> &'static str {
        match self {
            BaseSource::Archive => "archive",
            BaseSource::Bootstrap { .. } => "bootstrap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapTool {
    Debootstrap,
    Apk,
    Dnf,
}

impl BootstrapTool {
    /// Host binary the tool needs.
    pub fn host_binary(&self) -> &'static str {
        match self {
            BootstrapTool::Debootstrap => "debootstrap",
            BootstrapTool::Apk => "apk",
            BootstrapTool::Dnf => "dnf",
        }
    }
}

/// Package manager running inside the build root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Apk,
    Dnf,
}

impl PackageManager {
    /// Default for a distribution id.
    pub fn for_distro(distro: &str) -> Option<Self> {
        match distro.trim().to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" | "kali" => Some(PackageManager::Apt),
            "alpine" => Some(PackageManager::Apk),
            "fedora" | "rocky" | "alma" | "almalinux" | "centos" => Some(PackageManager::Dnf),
            _ => None,
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageManager::Apt => "apt",
            PackageManager::Apk => "apk",
            PackageManager::Dnf => "dnf",
        })
    }
}

/// Requested package set, split by how a failure is treated.
#[derive(Debug, Clone)]
pub struct PackageSet {
    pub manager: PackageManager,
    /// Failure is fatal: kernel, bootloader, runtime.
    pub essential: Vec<String>,
    /// Failure is a warning and the package is left out of the image.
    pub optional: Vec<String>,
    pub refresh_attempts: u32,
    pub refresh_backoff: Duration,
    pub refresh_timeout: Duration,
    pub install_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    OpenRc,
}

/// Inputs for the overlay composer. Templates only; no network.
#[derive(Debug, Clone)]
pub struct OverlaySpec {
    pub hostname: String,
    pub init: InitSystem,
    pub interface: String,
    /// Least-privilege login account.
    pub default_user: String,
    /// Account with sudo/wheel rights.
    pub admin_user: String,
    /// Shipped in clear text; always flagged in the run summary.
    pub placeholder_password: String,
    pub services: Vec<String>,
    /// Bundled monitoring application, copied verbatim.
    pub app_dir: Option<PathBuf>,
    pub firstboot_commands: Vec<String>,
    /// Place the archive at the ISO root for runtime loading.
    pub ship_in_image: bool,
    /// Apply the overlay to the rootfs before compression.
    pub merge_into_rootfs: bool,
}

/// Kernel command line and menu timing.
#[derive(Debug, Clone)]
pub struct BootSpec {
    pub cmdline: String,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Squashfs,
    Erofs,
}

impl CompressionFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            CompressionFormat::Squashfs => "filesystem.squashfs",
            CompressionFormat::Erofs => "filesystem.erofs",
        }
    }

    pub fn tool(&self) -> &'static str {
        match self {
            CompressionFormat::Squashfs => "mksquashfs",
            CompressionFormat::Erofs => "mkfs.erofs",
        }
    }
}

/// Size/speed trade-off for the compressed filesystem.
#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub format: CompressionFormat,
    pub algorithm: String,
    pub level: Option<u32>,
    pub block_size: String,
}

#[derive(Debug, Clone)]
pub struct PreflightSpec {
    pub min_free_bytes: u64,
    pub check_network: bool,
    pub require_root: bool,
}

/// Everything one run needs to know.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub name: String,
    pub version: String,
    /// ISO 9660 volume id; also used for `root=live:LABEL=` style lookups.
    pub label: String,
    pub arch: String,
    pub distro: String,
    pub release: String,
    pub output_dir: PathBuf,
    pub build_dir: PathBuf,
    pub keep_build_dir: bool,
    pub base: BaseSource,
    pub mirrors: Vec<String>,
    pub fetch_timeout: Duration,
    pub attempts_per_mirror: u32,
    pub packages: PackageSet,
    pub overlay: OverlaySpec,
    pub boot: BootSpec,
    pub compression: CompressionSettings,
    pub preflight: PreflightSpec,
}

impl BuildContext {
    pub fn layout(&self) -> BuildLayout {
        BuildLayout::new(&self.build_dir, self.compression.format)
    }

    /// `<output-dir>/<name>-<version>.iso`
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.iso", self.artifact_stem()))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.summary.json", self.artifact_stem()))
    }

    pub fn artifact_stem(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Marker identifying what produced a cached rootfs.
    pub fn acquisition_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.distro,
            self.release,
            self.arch,
            self.base.label()
        )
    }
}

/// Paths inside the build directory.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    pub root: PathBuf,
    pub rootfs: PathBuf,
    pub downloads: PathBuf,
    pub overlay: PathBuf,
    pub bootloader: PathBuf,
    pub compressed: PathBuf,
    pub iso_root: PathBuf,
}

impl BuildLayout {
    pub fn new(build_dir: &Path, format: CompressionFormat) -> Self {
        Self {
            root: build_dir.to_path_buf(),
            rootfs: build_dir.join("rootfs"),
            downloads: build_dir.join("downloads"),
            overlay: build_dir.join("overlay"),
            bootloader: build_dir.join("bootloader"),
            compressed: build_dir.join(format.file_name()),
            iso_root: build_dir.join("iso-root"),
        }
    }
}
