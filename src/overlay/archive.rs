//! Deterministic tar.zst serialization of an overlay bundle.
//!
//! Entries are written in sorted path order with zeroed mtime and ownership,
//! so two bundles with the same entries produce byte-identical archives.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tar::{EntryType, Header};

use super::Entry;
use crate::artifact::filesystem::atomic_move;
use crate::error::{BuildError, Result};

const ZSTD_LEVEL: i32 = 3;

/// Write `entries` (already sorted) to `out` via a temp file.
pub fn write<'a, I>(entries: I, out: &Path) -> Result<()>
where
    I: IntoIterator<Item = (&'a PathBuf, &'a Entry)>,
{
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io("creating directory", parent, e))?;
    }
    let mut tmp_name = out.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let result = write_to(entries, &tmp);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    atomic_move(&tmp, out)
}

fn write_to<'a, I>(entries: I, path: &Path) -> Result<()>
where
    I: IntoIterator<Item = (&'a PathBuf, &'a Entry)>,
{
    let io_err = |e| BuildError::io("writing overlay archive", path, e);

    let file = File::create(path).map_err(io_err)?;
    let encoder = zstd::stream::Encoder::new(BufWriter::new(file), ZSTD_LEVEL).map_err(io_err)?;
    let mut builder = tar::Builder::new(encoder);

    for (rel, entry) in entries {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match entry {
            Entry::Dir { mode } => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                header.set_mode(*mode);
                header.set_cksum();
                builder
                    .append_data(&mut header, rel, std::io::empty())
                    .map_err(io_err)?;
            }
            Entry::File { content, mode } => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(*mode);
                header.set_cksum();
                builder
                    .append_data(&mut header, rel, content.as_slice())
                    .map_err(io_err)?;
            }
            Entry::Symlink { target } => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder
                    .append_link(&mut header, rel, target)
                    .map_err(io_err)?;
            }
        }
    }

    let encoder = builder.into_inner().map_err(io_err)?;
    let mut writer = encoder.finish().map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

/// Paths stored in an overlay archive, in archive order.
pub fn list(path: &Path) -> Result<Vec<String>> {
    let io_err = |e| BuildError::io("reading overlay archive", path, e);
    let file = File::open(path).map_err(io_err)?;
    let decoder = zstd::stream::Decoder::new(file).map_err(io_err)?;
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive.entries().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
        names.push(name);
    }
    Ok(names)
}

/// Content of one regular file inside an overlay archive.
pub fn read_file(path: &Path, member: &str) -> Result<Option<Vec<u8>>> {
    let io_err = |e| BuildError::io("reading overlay archive", path, e);
    let file = File::open(path).map_err(io_err)?;
    let decoder = zstd::stream::Decoder::new(file).map_err(io_err)?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        if entry.path().map_err(io_err)?.as_ref() == Path::new(member) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(io_err)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}
