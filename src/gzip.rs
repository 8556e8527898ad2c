//! Gzip decoding for `Content-Encoding: gzip` request bodies.

use flate2::read::GzDecoder;
use std::io::{self, Read};

/// Decompress a gzip stream, refusing output larger than `limit` bytes.
pub fn decompress(bytes: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;

    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed body exceeds {} bytes", limit),
        ));
    }
    Ok(out)
}
