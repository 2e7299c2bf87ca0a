use std::io::{Read, Write};

use crate::error::Result;

pub mod lz4f;
pub mod store;

/// Codec seam between blob bytes on the wire and VM bytes on disk.
///
/// Producers may feed a whole chunk at once; consumers drive `decompress`
/// through bounded reads, so neither side needs the full payload resident.
pub trait Compressor: Send + Sync {
    /// Compress `src` into `dst`, returning the number of uncompressed
    /// bytes consumed.
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;

    /// Decompress `src` into `dst`, returning the number of uncompressed
    /// bytes produced.
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;
}
