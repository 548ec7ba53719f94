//! Binary framing shared by every on-disk file the engine writes.
//!
//! Every file starts with an 8-byte magic and a little-endian `u32` version. Payloads are
//! bincode-encoded and protected by a crc32. Writes go to a `.tmp` sibling first, then the
//! file is renamed into place and the parent directory is synced.

use crate::error::DbError;
use crc32fast::Hasher as Crc32;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, DbError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

/// Path of the temporary sibling used for atomic installs.
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), DbError> {
    let parent = path
        .parent()
        .ok_or_else(|| DbError::Internal("Missing parent dir".to_string()))?;
    let dir = File::open(parent)?;
    dir.sync_data()?;
    Ok(())
}

/// Checks the leading magic and version of a framed file.
pub(crate) fn read_header<R: Read>(
    r: &mut R,
    magic: &[u8; 8],
    version: u32,
    path: &Path,
) -> Result<(), DbError> {
    let mut got = [0u8; 8];
    r.read_exact(&mut got)?;
    if &got != magic {
        return Err(DbError::corruption(format!("Bad magic in {:?}", path)));
    }
    let v = read_u32(r)?;
    if v != version {
        return Err(DbError::corruption(format!(
            "Unsupported version {} in {:?}",
            v, path
        )));
    }
    Ok(())
}

/// Writes `value` as a single crc-protected bincode payload and installs it atomically.
///
/// Returns the size of the installed file in bytes.
pub(crate) fn write_framed_atomic<T: Serialize + ?Sized>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
    value: &T,
) -> Result<u64, DbError> {
    let bytes = bincode::serialize(value)?;
    let crc = crc32(&bytes);

    let tmp_path = tmp_path_for(path);
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(magic)?;
    w.write_all(&version.to_le_bytes())?;
    w.write_all(&(bytes.len() as u64).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;
    Ok(fs::metadata(path)?.len())
}

/// magic, version, payload length, crc
const FRAMED_HEADER_LEN: u64 = 8 + 4 + 8 + 4;

/// Reads a payload written by [`write_framed_atomic`], verifying magic, version and crc.
pub(crate) fn read_framed<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
) -> Result<T, DbError> {
    let mut f = File::open(path)?;
    let file_len = f.metadata()?.len();
    read_header(&mut f, magic, version, path)?;
    let len = read_u64(&mut f)?;
    let crc = read_u32(&mut f)?;
    let available = file_len.saturating_sub(FRAMED_HEADER_LEN);
    if len > available {
        return Err(DbError::corruption(format!(
            "payload length {} exceeds the {} bytes left in {:?}",
            len, available, path
        )));
    }
    let mut buf = vec![0u8; len as usize];
    f.read_exact(&mut buf)?;
    if crc32(&buf) != crc {
        return Err(DbError::corruption(format!("CRC mismatch in {:?}", path)));
    }
    Ok(bincode::deserialize(&buf)?)
}
