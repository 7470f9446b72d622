//! Gzip pass-through for compressed AVV streams.
//!
//! Encoders may ship the whole stream gzip-wrapped. The importer inflates
//! it transparently; everything downstream sees plain AVV bytes.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::util::{Error, Result};

/// Gzip member magic bytes.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Whether `data` starts with a gzip member header.
#[inline]
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Inflate `data` if it is gzip-wrapped, otherwise borrow it unchanged.
pub fn inflate_if_gzip(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !is_gzip(data) {
        return Ok(Cow::Borrowed(data));
    }

    // ISIZE trailer holds the inflated length mod 2^32
    let hint = data
        .len()
        .checked_sub(4)
        .map(|i| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize)
        .unwrap_or(0);

    let mut out = Vec::with_capacity(hint.min(1 << 30));
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::invalid(format!("gzip stream: {e}")))?;
    Ok(Cow::Owned(out))
}

/// Gzip-wrap `data`.
pub fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_data_borrowed() {
        let data = b"AVV\0plain";
        assert!(matches!(inflate_if_gzip(data).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_gzip_round_trip() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        let packed = gzip(&data, 6).unwrap();
        assert!(is_gzip(&packed));
        assert!(packed.len() < data.len());
        assert_eq!(inflate_if_gzip(&packed).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_corrupt_gzip() {
        let mut packed = gzip(b"hello world", 6).unwrap();
        let mid = packed.len() / 2;
        packed.truncate(mid);
        assert!(inflate_if_gzip(&packed).is_err());
    }
}
