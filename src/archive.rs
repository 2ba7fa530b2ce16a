//! Gzip archival of partition files.
//!
//! An archived partition keeps its name; it is recognised by the gzip magic at the start of
//! the file. Compression and decompression write a sibling temporary file and rename it over
//! the original, so a crash leaves either the old or the new file in place.

use crate::{Result, TslabError};
use flate2::{Compression, GzBuilder};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info};

/// First two bytes of every gzip member.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Deflate, the only compression method gzip defines.
const GZIP_DEFLATE: u8 = 8;

/// "Unknown" operating system, written into every archive header.
const GZIP_OS: u8 = 255;

/// Returns true when the file at `path` starts with the gzip header this module writes: the
/// magic, deflate, no flags, a zero mtime and the "unknown" OS byte. The extra-flags byte is
/// not checked.
///
/// A plain partition can start with the same bytes, so callers confirm the trailer too.
pub fn is_archived(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| TslabError::io_at(path, e))?;
    let mut header = [0u8; 10];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(header[..2] == GZIP_MAGIC
            && header[2] == GZIP_DEFLATE
            && header[3] == 0
            && header[4..8] == [0; 4]
            && header[9] == GZIP_OS),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(TslabError::io_at(path, e)),
    }
}

/// Uncompressed size recorded in the gzip trailer (ISIZE, modulo 2^32).
pub fn uncompressed_len(path: &Path) -> Result<u64> {
    let mut file = File::open(path).map_err(|e| TslabError::io_at(path, e))?;
    let len = file.metadata().map_err(|e| TslabError::io_at(path, e))?.len();
    if len < 18 {
        return Err(TslabError::Compression {
            path: path.to_path_buf(),
            details: format!("gzip file too short ({len} bytes)"),
        });
    }
    let mut trailer = [0u8; 4];
    file.seek(SeekFrom::End(-4))
        .and_then(|_| file.read_exact(&mut trailer))
        .map_err(|e| TslabError::io_at(path, e))?;
    Ok(u32::from_le_bytes(trailer) as u64)
}

fn compression_error(path: &Path, err: io::Error) -> TslabError {
    TslabError::Compression {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}

fn sibling_temp(path: &Path) -> Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    NamedTempFile::new_in(dir).map_err(|e| TslabError::io_at(dir, e))
}

fn persist(temp: NamedTempFile, path: &Path) -> Result<()> {
    temp.persist(path)
        .map_err(|e| TslabError::io_at(path, e.error))?;
    Ok(())
}

/// Replaces the plain partition at `path` with its gzip-compressed form.
pub fn compress_in_place(path: &Path) -> Result<()> {
    let source = File::open(path).map_err(|e| TslabError::io_at(path, e))?;
    let original = source.metadata().map_err(|e| TslabError::io_at(path, e))?.len();

    let temp = sibling_temp(path)?;
    {
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(GZIP_OS)
            .write(BufWriter::new(temp.as_file()), Compression::default());
        io::copy(&mut BufReader::new(source), &mut encoder)
            .map_err(|e| compression_error(path, e))?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(|e| compression_error(path, e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| TslabError::io_at(temp.path(), e))?;
    persist(temp, path)?;

    let compressed = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
    info!("Archived {:?}: {} -> {} bytes", path, original, compressed);
    Ok(())
}

/// Replaces the archived partition at `path` with its decompressed form.
pub fn decompress_in_place(path: &Path) -> Result<()> {
    let source = File::open(path).map_err(|e| TslabError::io_at(path, e))?;
    let temp = sibling_temp(path)?;
    let written = {
        let mut writer = BufWriter::new(temp.as_file());
        let written = io::copy(&mut GzDecoder::new(BufReader::new(source)), &mut writer)
            .map_err(|e| compression_error(path, e))?;
        writer.flush().map_err(|e| TslabError::io_at(temp.path(), e))?;
        written
    };
    temp.as_file()
        .sync_all()
        .map_err(|e| TslabError::io_at(temp.path(), e))?;
    persist(temp, path)?;

    info!("Unarchived {:?}: {} bytes", path, written);
    Ok(())
}

/// Decompresses the archive at `path` into an anonymous temporary file for read-only
/// mapping. The returned [`TempPath`] deletes the copy when dropped.
pub fn decompress_to_temp(path: &Path) -> Result<(File, TempPath, u64)> {
    let source = File::open(path).map_err(|e| TslabError::io_at(path, e))?;
    let temp = NamedTempFile::new().map_err(TslabError::Io)?;
    let written = {
        let mut writer = BufWriter::new(temp.as_file());
        let written = io::copy(&mut GzDecoder::new(BufReader::new(source)), &mut writer)
            .map_err(|e| compression_error(path, e))?;
        writer.flush().map_err(|e| TslabError::io_at(temp.path(), e))?;
        written
    };
    debug!("Decompressed {:?} to {:?} ({} bytes)", path, temp.path(), written);

    let (file, temp_path) = temp.into_parts();
    Ok((file, temp_path, written))
}
