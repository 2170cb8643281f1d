//! Unpacking of pre-built rootfs archives (tar, tar.gz, tar.zst).

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Zstd,
    Tar,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const USTAR_OFFSET: usize = 257;

/// Identify the container by magic bytes; file names from mirrors lie.
pub fn detect(path: &Path) -> Result<ArchiveFormat> {
    let mut head = [0u8; 512];
    let mut file = File::open(path).map_err(|e| BuildError::io("opening archive", path, e))?;
    let mut read = 0;
    while read < head.len() {
        let n = file
            .read(&mut head[read..])
            .map_err(|e| BuildError::io("reading archive", path, e))?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if read >= 2 && head[..2] == GZIP_MAGIC {
        return Ok(ArchiveFormat::Gzip);
    }
    if read >= 4 && head[..4] == ZSTD_MAGIC {
        return Ok(ArchiveFormat::Zstd);
    }
    if read >= USTAR_OFFSET + 5 && &head[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar" {
        return Ok(ArchiveFormat::Tar);
    }
    Err(BuildError::Postcondition(format!(
        "{} is not a tar, tar.gz or tar.zst archive",
        path.display()
    )))
}

/// Unpack `archive` into `dest`, preserving modes (and ownership when root).
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let format = detect(archive)?;
    fs::create_dir_all(dest).map_err(|e| BuildError::io("creating rootfs", dest, e))?;

    let file = File::open(archive).map_err(|e| BuildError::io("opening archive", archive, e))?;
    let reader = BufReader::new(file);
    match format {
        ArchiveFormat::Gzip => unpack_stream(GzDecoder::new(reader), archive, dest),
        ArchiveFormat::Zstd => {
            let decoder = zstd::stream::Decoder::new(reader)
                .map_err(|e| BuildError::io("opening zstd stream", archive, e))?;
            unpack_stream(decoder, archive, dest)
        }
        ArchiveFormat::Tar => unpack_stream(reader, archive, dest),
    }
}

fn unpack_stream<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<()> {
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    // SAFETY: geteuid has no preconditions.
    tar.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);
    tar.set_overwrite(true);
    tar.unpack(dest)
        .map_err(|e| BuildError::io("unpacking archive", archive, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let body = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/sh", &body[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn detects_and_unpacks_each_format() {
        let tmp = TempDir::new().unwrap();
        let raw = tar_bytes();

        let plain = tmp.path().join("a.tar");
        fs::write(&plain, &raw).unwrap();

        let gz = tmp.path().join("b.bin");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw).unwrap();
        fs::write(&gz, enc.finish().unwrap()).unwrap();

        let zst = tmp.path().join("c.tar.gz");
        fs::write(&zst, zstd::encode_all(&raw[..], 3).unwrap()).unwrap();

        assert_eq!(detect(&plain).unwrap(), ArchiveFormat::Tar);
        assert_eq!(detect(&gz).unwrap(), ArchiveFormat::Gzip);
        assert_eq!(detect(&zst).unwrap(), ArchiveFormat::Zstd);

        for (i, archive) in [plain, gz, zst].iter().enumerate() {
            let dest = tmp.path().join(format!("root{}", i));
            unpack(archive, &dest).unwrap();
            assert_eq!(fs::read(dest.join("bin/sh")).unwrap(), b"#!/bin/sh\n");
        }
    }

    #[test]
    fn rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let junk = tmp.path().join("index.html");
        fs::write(&junk, b"<html>404</html>").unwrap();
        assert!(matches!(
            detect(&junk).unwrap_err(),
            BuildError::Postcondition(_)
        ));
    }
}
