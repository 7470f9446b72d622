//! Fixed-point quantization helpers for AVV streams.
//!
//! Every quantized attribute in an AVV container (positions, bone weights,
//! uvs, normals, skeleton rotations) is stored as an unsigned integer of a
//! known bit width relative to a bounding interval. This crate holds the
//! pure mapping between those integers and floats, plus the byte-level
//! delta packing and a few packed attribute layouts shared by decoders.
//!
//! Nothing in here allocates state or touches I/O.

mod delta;
mod packed;

pub use delta::{delta_decode, delta_encode, DeltaError, DELTA_BIAS, MAX_DELTA_VALUE};
pub use packed::{decode_normal_oct16, rgb565_to_rgb8, PosQuat128};

/// Bit widths used by AVV quantized attributes.
pub const SUPPORTED_BITS: [u32; 5] = [8, 10, 12, 16, 20];

/// Largest integer representable with `bits` bits.
#[inline]
pub const fn max_value(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Map a `bits`-wide integer onto `[min, max]`.
///
/// `min + (value / (2^bits - 1)) * (max - min)`. Values wider than `bits`
/// are not masked; callers extract the field before decoding.
#[inline]
pub fn decode_fixed(bits: u32, value: u32, min: f32, max: f32) -> f32 {
    let zero_one = value as f32 / max_value(bits) as f32;
    zero_one * (max - min) + min
}

/// Inverse of [`decode_fixed`]: nearest integer code for `x`, clamped to the
/// representable range. A degenerate interval maps everything to 0.
#[inline]
pub fn quantize(x: f32, bits: u32, min: f32, max: f32) -> u32 {
    let range = max - min;
    if range <= 0.0 || !x.is_finite() {
        return 0;
    }
    let top = max_value(bits);
    let scaled = ((x - min) / range * top as f32).round();
    if scaled <= 0.0 {
        0
    } else if scaled >= top as f32 {
        top
    } else {
        scaled as u32
    }
}

#[inline]
pub fn decode_float8(x: u32, min: f32, max: f32) -> f32 {
    decode_fixed(8, x, min, max)
}

#[inline]
pub fn decode_float10(x: u32, min: f32, max: f32) -> f32 {
    decode_fixed(10, x, min, max)
}

#[inline]
pub fn decode_float12(x: u32, min: f32, max: f32) -> f32 {
    decode_fixed(12, x, min, max)
}

#[inline]
pub fn decode_float16(x: u32, min: f32, max: f32) -> f32 {
    decode_fixed(16, x, min, max)
}

#[inline]
pub fn decode_float20(x: u32, min: f32, max: f32) -> f32 {
    decode_fixed(20, x, min, max)
}

/// Largest error introduced by quantizing into `bits` bits over `[min, max]`.
#[inline]
pub fn quantization_step(bits: u32, min: f32, max: f32) -> f32 {
    (max - min) / max_value(bits) as f32
}
