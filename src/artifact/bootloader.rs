//! Boot menus and firmware loader staging.
//!
//! Writes an isolinux menu for BIOS and a GRUB menu for UEFI, each with the
//! same three entries, and copies the loader binaries out of the rootfs into
//! a staging tree laid out like the final ISO. A missing UEFI or BIOS loader
//! degrades the image to single-mode boot with a warning; missing both is an
//! error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::artifact::filesystem::copy_file;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::rootfs::find_in_root;

pub const ISO_KERNEL: &str = "live/vmlinuz";
pub const ISO_INITRD: &str = "live/initrd.img";
pub const ISOLINUX_DIR: &str = "isolinux";
pub const ISOLINUX_CFG: &str = "isolinux/isolinux.cfg";
pub const ISOLINUX_BIN: &str = "isolinux/isolinux.bin";
pub const BOOT_CATALOG: &str = "isolinux/boot.cat";
pub const GRUB_CFG: &str = "boot/grub/grub.cfg";
pub const EFI_BOOT_DIR: &str = "EFI/BOOT";

const ISOLINUX_CANDIDATES: &[&str] = &[
    "usr/lib/ISOLINUX/isolinux.bin",
    "usr/share/syslinux/isolinux.bin",
    "usr/lib/syslinux/isolinux.bin",
];
const LDLINUX_CANDIDATES: &[&str] = &[
    "usr/lib/syslinux/modules/bios/ldlinux.c32",
    "usr/share/syslinux/ldlinux.c32",
    "usr/lib/syslinux/ldlinux.c32",
];
const HYBRID_MBR_CANDIDATES: &[&str] = &[
    "usr/lib/ISOLINUX/isohdpfx.bin",
    "usr/share/syslinux/isohdpfx.bin",
    "usr/lib/syslinux/isohdpfx.bin",
];
const MENU_MODULE_DIRS: &[&str] = &[
    "usr/lib/syslinux/modules/bios",
    "usr/share/syslinux",
    "usr/lib/syslinux",
];
const MENU_MODULES: &[&str] = &["menu.c32", "libutil.c32", "libcom32.c32"];

/// One boot menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuEntry {
    pub id: &'static str,
    pub title: String,
    pub cmdline: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BiosLoader {
    /// Staged `isolinux.bin`, relative to the staging root.
    pub isolinux_bin: PathBuf,
    /// MBR template for USB-hybrid images; absent means ISO-only BIOS boot.
    pub hybrid_mbr: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UefiLoader {
    /// Staged EFI binary, relative to the staging root.
    pub efi_binary: PathBuf,
    pub source: PathBuf,
}

/// Staged bootloader tree plus what was found.
#[derive(Debug, Clone, Serialize)]
pub struct BootloaderConfig {
    pub staging: PathBuf,
    pub entries: Vec<MenuEntry>,
    pub bios: Option<BiosLoader>,
    pub uefi: Option<UefiLoader>,
    pub warnings: Vec<String>,
}

impl BootloaderConfig {
    pub fn is_hybrid(&self) -> bool {
        self.bios.is_some() && self.uefi.is_some()
    }
}

/// Default, verbose and recovery entries for `cmdline`.
pub fn menu_entries(name: &str, cmdline: &str) -> Vec<MenuEntry> {
    let base = cmdline.trim();
    vec![
        MenuEntry {
            id: "live",
            title: format!("{} (default)", name),
            cmdline: format!("{} quiet", base),
        },
        MenuEntry {
            id: "verbose",
            title: format!("{} (verbose boot)", name),
            cmdline: format!("{} loglevel=7 ignore_loglevel console=tty0 console=ttyS0,115200n8", base),
        },
        MenuEntry {
            id: "recovery",
            title: format!("{} (recovery shell)", name),
            cmdline: format!("{} init=/bin/sh", base),
        },
    ]
}

pub fn render_isolinux(entries: &[MenuEntry], timeout_secs: u32, with_menu: bool, title: &str) -> String {
    let mut out = String::new();
    if with_menu {
        out.push_str("UI menu.c32\n");
        out.push_str(&format!("MENU TITLE {}\n", title));
    } else {
        out.push_str("PROMPT 1\n");
    }
    out.push_str(&format!("DEFAULT {}\n", entries[0].id));
    // isolinux counts tenths of a second.
    out.push_str(&format!("TIMEOUT {}\n", timeout_secs * 10));
    for entry in entries {
        out.push_str(&format!(
            "\nLABEL {id}\n  MENU LABEL {title}\n  KERNEL /{kernel}\n  APPEND initrd=/{initrd} {cmdline}\n",
            id = entry.id,
            title = entry.title,
            kernel = ISO_KERNEL,
            initrd = ISO_INITRD,
            cmdline = entry.cmdline,
        ));
    }
    out
}

pub fn render_grub(entries: &[MenuEntry], timeout_secs: u32, label: &str) -> String {
    let mut out = format!(
        "set default=0\nset timeout={}\n\nsearch --no-floppy --set=root --label {}\n",
        timeout_secs, label
    );
    for entry in entries {
        out.push_str(&format!(
            "\nmenuentry \"{title}\" --id {id} {{\n    linux /{kernel} {cmdline}\n    initrd /{initrd}\n}}\n",
            title = entry.title,
            id = entry.id,
            kernel = ISO_KERNEL,
            initrd = ISO_INITRD,
            cmdline = entry.cmdline,
        ));
    }
    out
}

/// Entry names in an isolinux or GRUB config, in order.
pub fn parse_menu_labels(config: &str) -> Vec<String> {
    config
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("LABEL ") {
                return Some(rest.trim().to_string());
            }
            let rest = line.strip_prefix("menuentry ")?;
            let start = rest.find('"')? + 1;
            let end = rest[start..].find('"')? + start;
            Some(rest[start..end].to_string())
        })
        .collect()
}

fn efi_names(arch: &str) -> (&'static str, &'static str) {
    match arch {
        "aarch64" | "arm64" => ("BOOTAA64.EFI", "arm64-efi"),
        _ => ("BOOTX64.EFI", "x86_64-efi"),
    }
}

fn uefi_candidates(arch: &str) -> Vec<String> {
    let (_, grub_platform) = efi_names(arch);
    let short = if grub_platform.starts_with("arm64") { "aa64" } else { "x64" };
    vec![
        format!("usr/lib/grub/{}/monolithic/grub{}.efi", grub_platform, short),
        format!("usr/lib/grub/{}/monolithic/gcd{}.efi", grub_platform, short),
        format!("usr/lib/grub/{}-signed/grub{}.efi.signed", grub_platform, short),
        format!("usr/lib/grub/{}-signed/gcd{}.efi.signed", grub_platform, short),
        format!("boot/efi/EFI/BOOT/BOOT{}.EFI", short.to_ascii_uppercase()),
        format!("usr/share/grub/{}/grub.efi", grub_platform),
    ]
}

/// Write menus and stage loader binaries from `rootfs` into `staging`.
pub fn configure(ctx: &BuildContext, rootfs: &Path, staging: &Path) -> Result<BootloaderConfig> {
    if staging.exists() {
        fs::remove_dir_all(staging).map_err(|e| BuildError::io("cleaning", staging, e))?;
    }
    fs::create_dir_all(staging).map_err(|e| BuildError::io("creating", staging, e))?;

    let entries = menu_entries("CyberXP-OS", &ctx.boot.cmdline);
    let mut warnings = Vec::new();

    let bios = stage_bios(ctx, rootfs, staging, &entries)?;
    let uefi = stage_uefi(ctx, rootfs, staging, &entries)?;

    match (&bios, &uefi) {
        (Some(_), Some(_)) => info!("hybrid BIOS+UEFI boot staged"),
        (Some(_), None) => {
            let msg = format!(
                "UEFI loader not found in rootfs (looked for {}); image will boot on BIOS only",
                uefi_candidates(&ctx.arch).join(", ")
            );
            warn!("{}", msg);
            warnings.push(msg);
        }
        (None, Some(_)) => {
            let msg = "isolinux not found in rootfs; image will boot on UEFI only".to_string();
            warn!("{}", msg);
            warnings.push(msg);
        }
        (None, None) => {
            return Err(BuildError::Postcondition(
                "no BIOS (isolinux) or UEFI (GRUB) loader found in rootfs; install the bootloader packages"
                    .to_string(),
            ));
        }
    }
    if let Some(bios) = &bios {
        if bios.hybrid_mbr.is_none() {
            let msg = "isohdpfx.bin not found; BIOS image will not be USB-hybrid".to_string();
            warn!("{}", msg);
            warnings.push(msg);
        }
    }

    Ok(BootloaderConfig {
        staging: staging.to_path_buf(),
        entries,
        bios,
        uefi,
        warnings,
    })
}

fn stage_bios(
    ctx: &BuildContext,
    rootfs: &Path,
    staging: &Path,
    entries: &[MenuEntry],
) -> Result<Option<BiosLoader>> {
    if efi_names(&ctx.arch).1 != "x86_64-efi" {
        return Ok(None);
    }
    let (Some(isolinux), Some(ldlinux)) = (
        find_in_root(rootfs, ISOLINUX_CANDIDATES),
        find_in_root(rootfs, LDLINUX_CANDIDATES),
    ) else {
        return Ok(None);
    };

    let dir = staging.join(ISOLINUX_DIR);
    copy_file(&rootfs.join(isolinux), &dir.join("isolinux.bin"))?;
    copy_file(&rootfs.join(ldlinux), &dir.join("ldlinux.c32"))?;

    let mut with_menu = true;
    for module in MENU_MODULES {
        let candidates: Vec<String> = MENU_MODULE_DIRS
            .iter()
            .map(|d| format!("{}/{}", d, module))
            .collect();
        let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
        match find_in_root(rootfs, &refs) {
            Some(found) => {
                copy_file(&rootfs.join(found), &dir.join(module))?;
            }
            None => with_menu = false,
        }
    }

    let hybrid_mbr = match find_in_root(rootfs, HYBRID_MBR_CANDIDATES) {
        Some(found) => {
            let dest = dir.join("isohdpfx.bin");
            copy_file(&rootfs.join(found), &dest)?;
            Some(PathBuf::from(ISOLINUX_DIR).join("isohdpfx.bin"))
        }
        None => None,
    };

    let title = format!("CyberXP-OS {}", ctx.version);
    let cfg = staging.join(ISOLINUX_CFG);
    fs::write(&cfg, render_isolinux(entries, ctx.boot.timeout_secs, with_menu, &title))
        .map_err(|e| BuildError::io("writing", &cfg, e))?;

    info!(isolinux = isolinux, menu = with_menu, "BIOS loader staged");
    Ok(Some(BiosLoader {
        isolinux_bin: PathBuf::from(ISOLINUX_BIN),
        hybrid_mbr,
    }))
}

fn stage_uefi(
    ctx: &BuildContext,
    rootfs: &Path,
    staging: &Path,
    entries: &[MenuEntry],
) -> Result<Option<UefiLoader>> {
    let candidates = uefi_candidates(&ctx.arch);
    let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
    let Some(found) = find_in_root(rootfs, &refs) else {
        return Ok(None);
    };

    let (boot_name, _) = efi_names(&ctx.arch);
    let efi_rel = PathBuf::from(EFI_BOOT_DIR).join(boot_name);
    copy_file(&rootfs.join(found), &staging.join(&efi_rel))?;

    let grub = render_grub(entries, ctx.boot.timeout_secs, &ctx.label);
    for rel in [GRUB_CFG, &format!("{}/grub.cfg", EFI_BOOT_DIR)] {
        let path = staging.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io("creating", parent, e))?;
        }
        fs::write(&path, &grub).map_err(|e| BuildError::io("writing", &path, e))?;
    }

    info!(source = found, "UEFI loader staged");
    Ok(Some(UefiLoader {
        efi_binary: efi_rel,
        source: PathBuf::from(found),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use tempfile::TempDir;

    fn ctx() -> BuildContext {
        config::parse(
            r#"
[image]
name = "cyberxp-os"
version = "1.0"

[base]
distro = "debian"
release = "bookworm"
mirrors = ["http://mirror.example/base.tar.gz"]

[packages]
essential = ["linux-image-amd64"]
"#,
            Path::new("/"),
        )
        .unwrap()
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"bin").unwrap();
    }

    #[test]
    fn three_entries_in_both_menus() {
        let entries = menu_entries("CyberXP-OS", "boot=live components");
        let iso = render_isolinux(&entries, 5, true, "CyberXP-OS");
        let grub = render_grub(&entries, 5, "CYBERXP_OS");
        assert_eq!(parse_menu_labels(&iso), vec!["live", "verbose", "recovery"]);
        assert_eq!(
            parse_menu_labels(&grub),
            vec![
                "CyberXP-OS (default)",
                "CyberXP-OS (verbose boot)",
                "CyberXP-OS (recovery shell)"
            ]
        );
        assert!(iso.contains("TIMEOUT 50"));
        assert!(grub.contains("init=/bin/sh"));
    }

    #[test]
    fn hybrid_when_both_loaders_present() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        touch(&rootfs, "usr/lib/ISOLINUX/isolinux.bin");
        touch(&rootfs, "usr/lib/ISOLINUX/isohdpfx.bin");
        touch(&rootfs, "usr/lib/syslinux/modules/bios/ldlinux.c32");
        touch(&rootfs, "usr/lib/grub/x86_64-efi/monolithic/grubx64.efi");

        let staging = tmp.path().join("bootloader");
        let cfg = configure(&ctx(), &rootfs, &staging).unwrap();
        assert!(cfg.is_hybrid());
        assert!(cfg.warnings.is_empty());
        assert!(staging.join("EFI/BOOT/BOOTX64.EFI").exists());
        assert!(staging.join(GRUB_CFG).exists());
        assert!(staging.join(ISOLINUX_CFG).exists());
        // No menu.c32 staged, so the plain prompt is used.
        let iso = fs::read_to_string(staging.join(ISOLINUX_CFG)).unwrap();
        assert!(iso.starts_with("PROMPT 1"));
    }

    #[test]
    fn missing_uefi_degrades_with_warning() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        touch(&rootfs, "usr/lib/ISOLINUX/isolinux.bin");
        touch(&rootfs, "usr/lib/ISOLINUX/isohdpfx.bin");
        touch(&rootfs, "usr/lib/syslinux/modules/bios/ldlinux.c32");

        let cfg = configure(&ctx(), &rootfs, &tmp.path().join("bootloader")).unwrap();
        assert!(cfg.bios.is_some());
        assert!(cfg.uefi.is_none());
        assert!(cfg.warnings.iter().any(|w| w.contains("UEFI")));
    }

    #[test]
    fn no_loader_at_all_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let err = configure(&ctx(), &rootfs, &tmp.path().join("bootloader")).unwrap_err();
        assert!(matches!(err, BuildError::Postcondition(_)));
    }
}
