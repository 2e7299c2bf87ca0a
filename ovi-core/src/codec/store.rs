use super::Compressor;
use crate::error::Result;
use std::io::{Read, Write};

/// Passthrough codec for uncompressed blobs (plain `application/octet-stream`).
pub struct Store;

impl Compressor for Store {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(std::io::copy(src, dst)?)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(std::io::copy(src, dst)?)
    }
}
