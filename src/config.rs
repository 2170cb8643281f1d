//! TOML build configuration.
//!
//! Parsed once, validated, and turned into the immutable [`BuildContext`].
//!
//! ```toml
//! [image]
//! name = "cyberxp-os"
//! version = "0.3.0"
//!
//! [base]
//! distro = "debian"
//! release = "bookworm"
//! strategy = "bootstrap"
//! mirrors = ["http://deb.debian.org/debian"]
//!
//! [packages]
//! essential = ["linux-image-amd64", "live-boot", "isolinux", "syslinux-common"]
//! optional = ["grub-efi-amd64-bin", "clamav"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::context::{
    BaseSource, BootSpec, BootstrapTool, BuildContext, CompressionFormat, CompressionSettings,
    InitSystem, OverlaySpec, PackageManager, PackageSet, PreflightSpec,
};

const MAX_LABEL_LEN: usize = 32;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    image: ImageToml,
    base: BaseToml,
    packages: PackagesToml,
    #[serde(default)]
    overlay: OverlayToml,
    #[serde(default)]
    boot: BootToml,
    #[serde(default)]
    compression: CompressionToml,
    #[serde(default)]
    preflight: PreflightToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    name: String,
    version: String,
    label: Option<String>,
    arch: Option<String>,
    output_dir: Option<String>,
    build_dir: Option<String>,
    #[serde(default)]
    keep_build_dir: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BaseToml {
    distro: String,
    release: String,
    strategy: Option<String>,
    mirrors: Vec<String>,
    fetch_timeout_secs: Option<u64>,
    attempts_per_mirror: Option<u32>,
    bootstrap_tool: Option<String>,
    suite: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagesToml {
    manager: Option<String>,
    essential: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
    refresh_attempts: Option<u32>,
    refresh_backoff_secs: Option<u64>,
    refresh_timeout_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverlayToml {
    hostname: Option<String>,
    init: Option<String>,
    interface: Option<String>,
    default_user: Option<String>,
    admin_user: Option<String>,
    placeholder_password: Option<String>,
    #[serde(default)]
    services: Vec<String>,
    app_dir: Option<String>,
    #[serde(default)]
    firstboot_commands: Vec<String>,
    ship_in_image: Option<bool>,
    merge_into_rootfs: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootToml {
    cmdline: Option<String>,
    timeout_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompressionToml {
    format: Option<String>,
    algorithm: Option<String>,
    level: Option<u32>,
    block_size: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreflightToml {
    min_free_gib: Option<u64>,
    check_network: Option<bool>,
    require_root: Option<bool>,
}

/// Read and validate a config file. Relative paths resolve against its directory.
pub fn load(path: &Path) -> Result<BuildContext> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading build config '{}'", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parse(&text, base_dir).with_context(|| format!("invalid build config '{}'", path.display()))
}

/// Parse config text, resolving relative paths against `base_dir`.
///
/// Every path in the resulting context is absolute: mount tables only list
/// absolute paths, and teardown matches against them.
pub fn parse(text: &str, base_dir: &Path) -> Result<BuildContext> {
    let parsed: BuildToml = toml::from_str(text).context("parsing TOML")?;
    let base_dir = absolute_dir(base_dir)?;
    build_context(parsed, &base_dir)
}

fn build_context(raw: BuildToml, base_dir: &Path) -> Result<BuildContext> {
    let image = raw.image;
    let name = image.name.trim().to_string();
    let version = image.version.trim().to_string();
    validate_token("image.name", &name)?;
    validate_token("image.version", &version)?;

    let label = match image.label {
        Some(label) => label.trim().to_string(),
        None => default_label(&name),
    };
    validate_label(&label)?;

    let distro = raw.base.distro.trim().to_ascii_lowercase();
    let release = raw.base.release.trim().to_string();
    if distro.is_empty() || release.is_empty() {
        bail!("base.distro and base.release must not be empty");
    }

    let mirrors: Vec<String> = raw
        .base
        .mirrors
        .iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if mirrors.is_empty() {
        bail!("base.mirrors must list at least one endpoint");
    }

    let manager = match raw.packages.manager.as_deref() {
        Some(raw_pm) => parse_manager(raw_pm)?,
        None => PackageManager::for_distro(&distro).ok_or_else(|| {
            anyhow::anyhow!(
                "cannot infer packages.manager for distro '{}'; set it explicitly",
                distro
            )
        })?,
    };

    let base = match raw
        .base
        .strategy
        .as_deref()
        .unwrap_or("archive")
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "archive" => BaseSource::Archive,
        "bootstrap" => {
            let tool = match raw.base.bootstrap_tool.as_deref() {
                Some(tool) => parse_bootstrap_tool(tool)?,
                None => default_bootstrap_tool(manager),
            };
            BaseSource::Bootstrap {
                tool,
                suite: raw.base.suite.unwrap_or_else(|| release.clone()),
            }
        }
        other => bail!(
            "unsupported base.strategy '{}' (expected 'archive' or 'bootstrap')",
            other
        ),
    };

    let essential = normalize_packages(raw.packages.essential);
    let optional = normalize_packages(raw.packages.optional);
    if essential.is_empty() {
        bail!("packages.essential must not be empty (kernel and bootloader are required)");
    }
    if let Some(dup) = essential.iter().find(|p| optional.contains(p)) {
        bail!("package '{}' is listed as both essential and optional", dup);
    }

    let overlay = raw.overlay;
    let init = match overlay.init.as_deref() {
        Some(init) => parse_init(init)?,
        None if manager == PackageManager::Apk => InitSystem::OpenRc,
        None => InitSystem::Systemd,
    };
    let overlay = OverlaySpec {
        hostname: overlay.hostname.unwrap_or_else(|| name.clone()),
        init,
        interface: overlay.interface.unwrap_or_else(|| "eth0".to_string()),
        default_user: overlay.default_user.unwrap_or_else(|| "cyberxp".to_string()),
        admin_user: overlay.admin_user.unwrap_or_else(|| "admin".to_string()),
        placeholder_password: overlay
            .placeholder_password
            .unwrap_or_else(|| "cyberxp".to_string()),
        services: overlay.services,
        app_dir: overlay.app_dir.map(|p| resolve_path(base_dir, &p)),
        firstboot_commands: overlay.firstboot_commands,
        ship_in_image: overlay.ship_in_image.unwrap_or(true),
        merge_into_rootfs: overlay.merge_into_rootfs.unwrap_or(true),
    };
    if !overlay.ship_in_image && !overlay.merge_into_rootfs {
        bail!("overlay must be shipped in the image, merged into the rootfs, or both");
    }

    let boot = BootSpec {
        cmdline: raw
            .boot
            .cmdline
            .unwrap_or_else(|| default_cmdline(manager, &label)),
        timeout_secs: raw.boot.timeout_secs.unwrap_or(5),
    };

    let format = match raw
        .compression
        .format
        .as_deref()
        .unwrap_or("squashfs")
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "squashfs" => CompressionFormat::Squashfs,
        "erofs" => CompressionFormat::Erofs,
        other => bail!("unsupported compression.format '{}'", other),
    };
    let compression = CompressionSettings {
        format,
        algorithm: raw.compression.algorithm.unwrap_or_else(|| match format {
            CompressionFormat::Squashfs => "xz".to_string(),
            CompressionFormat::Erofs => "zstd".to_string(),
        }),
        level: raw.compression.level.or(match format {
            CompressionFormat::Squashfs => None,
            CompressionFormat::Erofs => Some(6),
        }),
        block_size: raw.compression.block_size.unwrap_or_else(|| "1M".to_string()),
    };

    let output_dir = resolve_path(base_dir, image.output_dir.as_deref().unwrap_or("out"));
    let build_dir = match image.build_dir.as_deref() {
        Some(dir) => resolve_path(base_dir, dir),
        None => default_build_dir(&name, &version, &output_dir),
    };

    Ok(BuildContext {
        name,
        version,
        label,
        arch: image.arch.unwrap_or_else(|| "x86_64".to_string()),
        distro,
        release,
        output_dir,
        build_dir,
        keep_build_dir: image.keep_build_dir,
        base,
        mirrors,
        fetch_timeout: Duration::from_secs(raw.base.fetch_timeout_secs.unwrap_or(300)),
        attempts_per_mirror: raw.base.attempts_per_mirror.unwrap_or(1).max(1),
        packages: PackageSet {
            manager,
            essential,
            optional,
            refresh_attempts: raw.packages.refresh_attempts.unwrap_or(3).max(1),
            refresh_backoff: Duration::from_secs(raw.packages.refresh_backoff_secs.unwrap_or(5)),
            refresh_timeout: Duration::from_secs(raw.packages.refresh_timeout_secs.unwrap_or(600)),
            install_timeout: Duration::from_secs(
                raw.packages.install_timeout_secs.unwrap_or(3600),
            ),
        },
        overlay,
        boot,
        compression,
        preflight: PreflightSpec {
            min_free_bytes: raw.preflight.min_free_gib.unwrap_or(10) * GIB,
            check_network: raw.preflight.check_network.unwrap_or(true),
            require_root: raw.preflight.require_root.unwrap_or(true),
        },
    })
}

fn validate_token(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field} must not be empty");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        bail!("{field} '{}' may only contain [A-Za-z0-9._-]", value);
    }
    Ok(())
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        bail!(
            "image.label '{}' must be 1-{} characters",
            label,
            MAX_LABEL_LEN
        );
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        bail!("image.label '{}' may only contain [A-Z0-9_]", label);
    }
    Ok(())
}

fn default_label(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

fn parse_manager(raw: &str) -> Result<PackageManager> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "apt" => Ok(PackageManager::Apt),
        "apk" => Ok(PackageManager::Apk),
        "dnf" => Ok(PackageManager::Dnf),
        other => bail!("unsupported packages.manager '{}'", other),
    }
}

fn parse_bootstrap_tool(raw: &str) -> Result<BootstrapTool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "debootstrap" => Ok(BootstrapTool::Debootstrap),
        "apk" => Ok(BootstrapTool::Apk),
        "dnf" => Ok(BootstrapTool::Dnf),
        other => bail!("unsupported base.bootstrap_tool '{}'", other),
    }
}

fn default_bootstrap_tool(manager: PackageManager) -> BootstrapTool {
    match manager {
        PackageManager::Apt => BootstrapTool::Debootstrap,
        PackageManager::Apk => BootstrapTool::Apk,
        PackageManager::Dnf => BootstrapTool::Dnf,
    }
}

fn parse_init(raw: &str) -> Result<InitSystem> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "systemd" => Ok(InitSystem::Systemd),
        "openrc" => Ok(InitSystem::OpenRc),
        other => bail!(
            "unsupported overlay.init '{}' (expected 'systemd' or 'openrc')",
            other
        ),
    }
}

fn default_cmdline(manager: PackageManager, label: &str) -> String {
    match manager {
        PackageManager::Apt => "boot=live components".to_string(),
        PackageManager::Apk => "modules=loop,squashfs,sd-mod,usb-storage".to_string(),
        PackageManager::Dnf => format!("root=live:CDLABEL={} rd.live.image", label),
    }
}

fn normalize_packages(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = raw
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw.trim());
    if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&base_dir.join(candidate))
    }
}

fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        env::current_dir()
            .context("resolving current directory")?
            .join(dir)
    };
    Ok(fs::canonicalize(&absolute).unwrap_or_else(|_| normalize(&absolute)))
}

/// Drop `.` and fold `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn default_build_dir(name: &str, version: &str, output_dir: &Path) -> PathBuf {
    match dirs::cache_dir() {
        Some(cache) => cache
            .join("cyberxp-builder")
            .join(format!("{}-{}", name, version)),
        None => output_dir.join(".build"),
    }
}
