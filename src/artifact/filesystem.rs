//! Filesystem utilities shared by the artifact stages.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{BuildError, Result};

/// Copy one file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating directory", parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| BuildError::io("copying", src, e))
}

/// Recursively copy a directory, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| BuildError::io("creating directory", dst, e))?;

    let entries = fs::read_dir(src).map_err(|e| BuildError::io("reading directory", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io("reading directory", src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| BuildError::io("stat", &src_path, e))?;

        if file_type.is_symlink() {
            let target =
                fs::read_link(&src_path).map_err(|e| BuildError::io("reading symlink", &src_path, e))?;
            if fs::symlink_metadata(&dst_path).is_ok() {
                fs::remove_file(&dst_path).map_err(|e| BuildError::io("removing", &dst_path, e))?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .map_err(|e| BuildError::io("creating symlink", &dst_path, e))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| BuildError::io("copying", &src_path, e))?;
        }
    }

    Ok(())
}

/// Move a file by renaming, with fallback to copy+delete across filesystems.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst).map_err(|e| BuildError::io("copying", src, e))?;
            fs::remove_file(src).map_err(|e| BuildError::io("removing", src, e))?;
            Ok(())
        }
    }
}

/// Size of `path` if it is a regular file with content.
pub fn non_empty_file(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|m| m.is_file() && m.len() > 0)
        .map(|m| m.len())
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).map_err(|e| BuildError::io("opening", path, e))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf).map_err(|e| BuildError::io("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<file>.sha256` in `sha256sum` format and return the digest.
pub fn write_checksum_file(path: &Path) -> Result<String> {
    let digest = sha256_file(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    let sidecar = Path::new(&sidecar);
    fs::write(sidecar, format!("{}  {}\n", digest, name))
        .map_err(|e| BuildError::io("writing checksum", sidecar, e))?;
    Ok(digest)
}
