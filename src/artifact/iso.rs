//! Hybrid ISO assembly.
//!
//! Lays out the ISO tree (kernel, initramfs, compressed rootfs, loader
//! files, optional overlay archive), builds the EFI El Torito image with
//! mtools and masters the result with `xorriso`. The image is written to a
//! `.partial` path and only renamed into place once it verifies.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::artifact::boot_assets::BootAssets;
use crate::artifact::bootloader::{
    parse_menu_labels, BootloaderConfig, BOOT_CATALOG, EFI_BOOT_DIR, GRUB_CFG, ISOLINUX_CFG,
    ISO_INITRD, ISO_KERNEL,
};
use crate::artifact::filesystem::{
    atomic_move, copy_dir_recursive, copy_file, non_empty_file, write_checksum_file,
};
use crate::artifact::squashfs::CompressedFilesystem;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::overlay;
use crate::process::{Cmd, Executor};

pub const ISO_LIVE_DIR: &str = "live";
pub const EFIBOOT_IMG: &str = "boot/grub/efiboot.img";
const EFIBOOT_MIN_MB: u64 = 16;

/// Everything the assembler consumes.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInputs<'a> {
    pub boot: &'a BootAssets,
    pub filesystem: &'a CompressedFilesystem,
    pub bootloader: &'a BootloaderConfig,
    /// Overlay archive to ship at the ISO root.
    pub overlay_archive: Option<&'a Path>,
}

/// The finished image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub label: String,
    pub sha256: String,
    pub boot_modes: Vec<&'static str>,
}

/// Lay out `iso_root` for the given inputs. Any previous tree is removed.
pub fn stage_tree(iso_root: &Path, inputs: &AssemblyInputs<'_>) -> Result<()> {
    if iso_root.exists() {
        fs::remove_dir_all(iso_root).map_err(|e| BuildError::io("cleaning", iso_root, e))?;
    }
    fs::create_dir_all(iso_root.join(ISO_LIVE_DIR))
        .map_err(|e| BuildError::io("creating", iso_root, e))?;

    copy_file(&inputs.boot.kernel, &iso_root.join(ISO_KERNEL))?;
    copy_file(&inputs.boot.initramfs, &iso_root.join(ISO_INITRD))?;

    let fs_name = inputs
        .filesystem
        .path
        .file_name()
        .ok_or_else(|| BuildError::Precondition("compressed filesystem has no file name".into()))?;
    link_or_copy(
        &inputs.filesystem.path,
        &iso_root.join(ISO_LIVE_DIR).join(fs_name),
    )?;

    copy_dir_recursive(&inputs.bootloader.staging, iso_root)?;

    if let Some(archive) = inputs.overlay_archive {
        copy_file(archive, &iso_root.join(overlay::ARCHIVE_NAME))?;
    }
    Ok(())
}

/// The compressed image is large; hard-link it when source and tree share a filesystem.
fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    copy_file(src, dst).map(|_| ())
}

/// Every staged menu must carry the same three entries.
fn check_menus(staging: &Path, bootloader: &BootloaderConfig) -> Result<()> {
    let mut menus = Vec::new();
    if bootloader.bios.is_some() {
        menus.push(ISOLINUX_CFG);
    }
    if bootloader.uefi.is_some() {
        menus.push(GRUB_CFG);
    }
    for rel in menus {
        let path = staging.join(rel);
        let text = fs::read_to_string(&path).map_err(|e| BuildError::io("reading", &path, e))?;
        let labels = parse_menu_labels(&text);
        if labels.len() != bootloader.entries.len() {
            return Err(BuildError::Postcondition(format!(
                "{} has {} menu entries, expected {}",
                rel,
                labels.len(),
                bootloader.entries.len()
            )));
        }
    }
    Ok(())
}

/// Size in MiB for a FAT image holding `payload` bytes.
pub fn efiboot_size_mb(payload: u64) -> u64 {
    let mb = payload.div_ceil(1024 * 1024) + 2;
    mb.max(EFIBOOT_MIN_MB)
}

fn create_fat16_image(output: &Path, size_mb: u64, exec: &dyn Executor) -> Result<()> {
    Cmd::new("dd")
        .args(["if=/dev/zero", &format!("of={}", output.display())])
        .args(["bs=1M", &format!("count={}", size_mb)])
        .error_msg("dd (EFI image)")
        .run(exec)?;
    Cmd::new("mkfs.fat")
        .args(["-F", "16", "-n", "EFIBOOT"])
        .arg_path(output)
        .error_msg("mkfs.fat")
        .run(exec)?;
    Ok(())
}

/// Build the FAT image that UEFI firmware boots from, containing `EFI/BOOT/*`.
pub fn create_efi_boot_image(output: &Path, efi_dir: &Path, exec: &dyn Executor) -> Result<()> {
    let mut files = Vec::new();
    let entries = fs::read_dir(efi_dir).map_err(|e| BuildError::io("reading", efi_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io("reading", efi_dir, e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    let payload: u64 = files
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating", parent, e))?;
    }
    create_fat16_image(output, efiboot_size_mb(payload), exec)?;

    let img = output.to_string_lossy().into_owned();
    for dir in ["::EFI", "::EFI/BOOT"] {
        Cmd::new("mmd")
            .args(["-i", &img, dir])
            .error_msg(format!("mmd {}", dir))
            .run(exec)?;
    }
    for file in &files {
        Cmd::new("mcopy")
            .args(["-i", &img])
            .arg_path(file)
            .arg("::EFI/BOOT/")
            .error_msg(format!("mcopy {}", file.display()))
            .run(exec)?;
    }
    Ok(())
}

/// xorriso invocation for the staged tree.
pub fn xorriso_cmd(
    iso_root: &Path,
    output: &Path,
    label: &str,
    bootloader: &BootloaderConfig,
) -> Cmd {
    let mut cmd = Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-iso-level", "3", "-full-iso9660-filenames"])
        .args(["-volid", label])
        .args(["-joliet", "-rational-rock"]);

    let mut hybrid_mbr = false;
    if let Some(bios) = &bootloader.bios {
        if let Some(mbr) = &bios.hybrid_mbr {
            cmd = cmd.arg("-isohybrid-mbr").arg_path(&iso_root.join(mbr));
            hybrid_mbr = true;
        }
        cmd = cmd
            .arg("-eltorito-boot")
            .arg_path(&bios.isolinux_bin)
            .args(["-eltorito-catalog", BOOT_CATALOG])
            .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"]);
    }
    if bootloader.uefi.is_some() {
        if bootloader.bios.is_some() {
            cmd = cmd.arg("-eltorito-alt-boot");
        }
        cmd = cmd.args(["-e", EFIBOOT_IMG, "-no-emul-boot"]);
        if hybrid_mbr {
            cmd = cmd.arg("-isohybrid-gpt-basdat");
        } else {
            cmd = cmd.args(["-append_partition", "2", "0xef"]).arg_path(&iso_root.join(EFIBOOT_IMG));
        }
    }
    cmd.arg_path(iso_root)
}

/// Assemble the bootable image at `ctx.artifact_path()`.
pub fn assemble(
    ctx: &BuildContext,
    inputs: &AssemblyInputs<'_>,
    exec: &dyn Executor,
) -> Result<ImageArtifact> {
    let layout = ctx.layout();
    let iso_root = &layout.iso_root;
    let bootloader = inputs.bootloader;

    check_menus(&bootloader.staging, bootloader)?;
    stage_tree(iso_root, inputs)?;

    if bootloader.uefi.is_some() {
        create_efi_boot_image(&iso_root.join(EFIBOOT_IMG), &iso_root.join(EFI_BOOT_DIR), exec)?;
    }

    let output = ctx.artifact_path();
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating", parent, e))?;
    }
    let mut partial = output.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    if partial.exists() {
        fs::remove_file(&partial).map_err(|e| BuildError::io("removing", &partial, e))?;
    }

    info!(output = %output.display(), label = %ctx.label, "mastering ISO");
    let result = xorriso_cmd(iso_root, &partial, &ctx.label, bootloader)
        .progress("xorriso")
        .error_msg("xorriso")
        .run(exec);
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    if non_empty_file(&partial).is_none() {
        let _ = fs::remove_file(&partial);
        return Err(BuildError::Postcondition(format!(
            "xorriso exited successfully but {} is missing or empty",
            partial.display()
        )));
    }
    atomic_move(&partial, &output)?;
    let size = non_empty_file(&output).ok_or_else(|| {
        BuildError::Postcondition(format!("{} vanished after rename", output.display()))
    })?;
    let sha256 = write_checksum_file(&output)?;

    let mut boot_modes = Vec::new();
    if bootloader.bios.is_some() {
        boot_modes.push("bios");
    }
    if bootloader.uefi.is_some() {
        boot_modes.push("uefi");
    }
    info!(size_mib = size / (1024 * 1024), sha256 = %sha256, "ISO ready");

    Ok(ImageArtifact {
        path: output,
        size,
        label: ctx.label.clone(),
        sha256,
        boot_modes,
    })
}
