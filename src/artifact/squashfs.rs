//! Compressed read-only filesystem image (squashfs or EROFS).
//!
//! This is the longest-running stage. The command carries a progress label so
//! the executor logs elapsed time while it runs; there is no timeout, but the
//! child is killed on cancellation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::artifact::filesystem::non_empty_file;
use crate::context::{CompressionFormat, CompressionSettings};
use crate::error::{BuildError, Result};
use crate::process::{Cmd, Executor};

/// Directories left out of the image. `boot` is already on the ISO.
pub const EXCLUDED: &[&str] = &["boot"];

#[derive(Debug, Clone, Serialize)]
pub struct CompressedFilesystem {
    pub path: PathBuf,
    pub size: u64,
    pub format: &'static str,
}

/// Command line for compressing `source` into `output`.
pub fn compress_cmd(source: &Path, output: &Path, settings: &CompressionSettings) -> Cmd {
    match settings.format {
        CompressionFormat::Squashfs => {
            let mut cmd = Cmd::new("mksquashfs")
                .arg_path(source)
                .arg_path(output)
                .args(["-comp", &settings.algorithm])
                .args(["-b", &settings.block_size])
                .arg("-noappend")
                .arg("-no-progress");
            if let Some(level) = settings.level {
                cmd = cmd.args(["-Xcompression-level", &level.to_string()]);
            }
            // -e consumes the rest of the line, so it goes last.
            cmd.arg("-e").args(EXCLUDED)
        }
        CompressionFormat::Erofs => {
            let compression = match settings.level {
                Some(level) => format!("{},{}", settings.algorithm, level),
                None => settings.algorithm.clone(),
            };
            // mkfs.erofs takes OUTPUT before SOURCE, the opposite of mksquashfs.
            let mut cmd = Cmd::new("mkfs.erofs")
                .args(["-z", &compression])
                .arg("-T0");
            for excluded in EXCLUDED {
                cmd = cmd.arg(format!("--exclude-path={}", excluded));
            }
            cmd.arg_path(output).arg_path(source)
        }
    }
}

/// Serialize `rootfs` into a single compressed image at `output`.
pub fn compress(
    rootfs: &Path,
    output: &Path,
    settings: &CompressionSettings,
    exec: &dyn Executor,
) -> Result<CompressedFilesystem> {
    if !rootfs.is_dir() {
        return Err(BuildError::Precondition(format!(
            "rootfs {} is not a directory",
            rootfs.display()
        )));
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating directory", parent, e))?;
    }
    if output.exists() {
        fs::remove_file(output).map_err(|e| BuildError::io("removing stale image", output, e))?;
    }

    info!(
        format = settings.format.tool(),
        algorithm = %settings.algorithm,
        output = %output.display(),
        "compressing root filesystem"
    );
    compress_cmd(rootfs, output, settings)
        .progress("compress")
        .error_msg(settings.format.tool())
        .run(exec)?;

    let size = non_empty_file(output).ok_or_else(|| {
        BuildError::Postcondition(format!(
            "{} reported success but {} is missing or empty",
            settings.format.tool(),
            output.display()
        ))
    })?;
    info!(size_mib = size / (1024 * 1024), "compressed filesystem ready");

    Ok(CompressedFilesystem {
        path: output.to_path_buf(),
        size,
        format: settings.format.tool(),
    })
}
