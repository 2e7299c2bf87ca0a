use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Files are hashed in bounded slices; a disk image is never fully resident.
const READ_SLICE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("offset {offset} past end of file ({file_len} bytes)")]
    InvalidOffset { offset: u64, file_len: u64 },

    #[error("range {offset}+{size} exceeds file length {file_len}")]
    InvalidSize { offset: u64, size: u64, file_len: u64 },

    #[error("file read failed: {0}")]
    FileReadError(#[from] std::io::Error),
}

/// Canonical `sha256:<hex>` digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Digest of `size` bytes of `path` starting at `offset`.
///
/// `size == 0` yields the digest of empty input.
pub fn digest_file_range(path: &Path, offset: u64, size: u64) -> Result<String, DigestError> {
    let mut f = File::open(path)?;
    let file_len = f.metadata()?.len();
    if offset > file_len {
        return Err(DigestError::InvalidOffset { offset, file_len });
    }
    match offset.checked_add(size) {
        Some(end) if end <= file_len => {}
        _ => return Err(DigestError::InvalidSize { offset, size, file_len }),
    }

    f.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_SLICE.min(size.max(1) as usize)];
    let mut remaining = size;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = f.read(&mut buf[..want])?;
        if n == 0 {
            return Err(DigestError::FileReadError(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Digest of an entire file.
pub fn digest_file(path: &Path) -> Result<String, DigestError> {
    let file_len = std::fs::metadata(path)?.len();
    digest_file_range(path, 0, file_len)
}
