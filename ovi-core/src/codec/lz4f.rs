use super::Compressor;
use crate::error::Result;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{Read, Write};

/// LZ4 frame codec for disk chunks and the nvram blob.
pub struct Lz4;

impl Compressor for Lz4 {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut enc = FrameEncoder::new(dst);
        let consumed = std::io::copy(src, &mut enc)?;
        enc.finish()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(consumed)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut dec = FrameDecoder::new(src);
        Ok(std::io::copy(&mut dec, dst)?)
    }
}

/// Streaming decoder for the pull path: a `Read` that yields decompressed
/// bytes on demand without retaining either side of the stream.
pub fn decoder<R: Read>(src: R) -> FrameDecoder<R> {
    FrameDecoder::new(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_preserves_bytes() {
        let mut raw = vec![0u8; 256 * 1024];
        raw[0] = 0x41;
        raw[100_000] = 0x42;

        let mut compressed = Vec::new();
        let consumed = Lz4.compress(&mut raw.as_slice(), &mut compressed).unwrap();
        assert_eq!(consumed, raw.len() as u64);
        assert!(compressed.len() < raw.len());

        let mut out = Vec::new();
        let produced = Lz4.decompress(&mut compressed.as_slice(), &mut out).unwrap();
        assert_eq!(produced, raw.len() as u64);
        assert_eq!(out, raw);
    }

    #[test]
    fn decoder_yields_bounded_slices() {
        let raw = vec![7u8; 64 * 1024];
        let mut compressed = Vec::new();
        Lz4.compress(&mut raw.as_slice(), &mut compressed).unwrap();

        let mut dec = decoder(compressed.as_slice());
        let mut slice = [0u8; 4096];
        let mut total = 0usize;
        loop {
            let n = dec.read(&mut slice).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= slice.len());
            assert!(slice[..n].iter().all(|&b| b == 7));
            total += n;
        }
        assert_eq!(total, raw.len());
    }
}
