//! Boot and image artifacts.
//!
//! - [`boot_assets`] - kernel selection and initramfs regeneration
//! - [`squashfs`] - compressed root filesystem (mksquashfs / mkfs.erofs)
//! - [`bootloader`] - isolinux and GRUB menus, loader staging
//! - [`iso`] - hybrid ISO mastering with xorriso
//! - [`filesystem`] - copy, move and checksum helpers

pub mod boot_assets;
pub mod bootloader;
pub mod filesystem;
pub mod iso;
pub mod squashfs;
