//! Variable-length delta packing for 15-bit quantized coordinates.
//!
//! Each value is written either as a single byte holding a biased delta
//! from the previous value (high bit clear), or as a two byte absolute
//! value whose first byte has the high bit set and carries the low 7 bits.
//! The second byte carries bits 7..15.

use std::fmt;

/// Bias applied to single-byte deltas, giving a range of `[-63, 63]`.
pub const DELTA_BIAS: i32 = 63;

/// Largest value the absolute form can hold.
pub const MAX_DELTA_VALUE: u16 = 0x7FFF;

const ABSOLUTE_FLAG: u8 = 0x80;

/// Failure while packing or unpacking a delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// Input value does not fit in 15 bits.
    ValueTooWide { index: usize, value: u16 },
    /// Stream ended in the middle of an absolute value.
    Truncated { offset: usize },
    /// A delta moved the running value outside `[0, 0x7FFF]`.
    OutOfRange { offset: usize },
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueTooWide { index, value } => {
                write!(f, "value {value} at index {index} exceeds 15 bits")
            }
            Self::Truncated { offset } => write!(f, "delta stream truncated at byte {offset}"),
            Self::OutOfRange { offset } => {
                write!(f, "delta at byte {offset} leaves the 15-bit range")
            }
        }
    }
}

impl std::error::Error for DeltaError {}

/// Pack a sequence of 15-bit values.
pub fn delta_encode(values: &[u16]) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::with_capacity(values.len() + values.len() / 4);
    let mut prev = 0i32;

    for (index, &value) in values.iter().enumerate() {
        if value > MAX_DELTA_VALUE {
            return Err(DeltaError::ValueTooWide { index, value });
        }
        let delta = value as i32 - prev;
        if (-DELTA_BIAS..=DELTA_BIAS).contains(&delta) {
            out.push((delta + DELTA_BIAS) as u8);
        } else {
            out.push(ABSOLUTE_FLAG | (value & 0x7F) as u8);
            out.push((value >> 7) as u8);
        }
        prev = value as i32;
    }

    Ok(out)
}

/// Unpack a full delta stream.
pub fn delta_decode(bytes: &[u8]) -> Result<Vec<u16>, DeltaError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut prev = 0i32;
    let mut pos = 0usize;

    while pos < bytes.len() {
        let b = bytes[pos];
        let value = if b & ABSOLUTE_FLAG == 0 {
            let v = prev + b as i32 - DELTA_BIAS;
            if !(0..=MAX_DELTA_VALUE as i32).contains(&v) {
                return Err(DeltaError::OutOfRange { offset: pos });
            }
            pos += 1;
            v
        } else {
            let Some(&hi) = bytes.get(pos + 1) else {
                return Err(DeltaError::Truncated { offset: pos });
            };
            pos += 2;
            ((b & 0x7F) as i32) | ((hi as i32) << 7)
        };
        out.push(value as u16);
        prev = value;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed() {
        let values: Vec<u16> = vec![0, 5, 68, 5, 32767, 32700, 12, 12, 13, 200, 0];
        let packed = delta_encode(&values).unwrap();
        assert_eq!(delta_decode(&packed).unwrap(), values);
    }

    #[test]
    fn test_round_trip_pseudo_random() {
        // xorshift keeps the test deterministic without a dependency
        let mut state = 0x2545_f491u32;
        let mut values = Vec::with_capacity(4096);
        let mut current = 1000i32;
        for _ in 0..4096 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            if state % 5 == 0 {
                current = (state >> 8) as i32 & 0x7FFF;
            } else {
                current = (current + (state % 129) as i32 - 64).clamp(0, 0x7FFF);
            }
            values.push(current as u16);
        }
        let packed = delta_encode(&values).unwrap();
        assert!(packed.len() < values.len() * 2);
        assert_eq!(delta_decode(&packed).unwrap(), values);
    }

    #[test]
    fn test_small_deltas_use_one_byte() {
        let packed = delta_encode(&[63, 0, 63]).unwrap();
        assert_eq!(packed, vec![126, 0, 126]);
    }

    #[test]
    fn test_absolute_layout() {
        let packed = delta_encode(&[0x1234]).unwrap();
        assert_eq!(packed, vec![0x80 | 0x34, (0x1234 >> 7) as u8]);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            delta_encode(&[1, 0x8000]),
            Err(DeltaError::ValueTooWide { index: 1, value: 0x8000 })
        );
        assert_eq!(delta_decode(&[0x81]), Err(DeltaError::Truncated { offset: 0 }));
        assert_eq!(delta_decode(&[0]), Err(DeltaError::OutOfRange { offset: 0 }));
    }
}
