//! Packed attribute layouts shared by the container parser and decoders.

use crate::{decode_float16, decode_float20, quantize};

/// Bone position + rotation packed into 128 bits.
///
/// Layout (`p0`, `p1` are little-endian `u64`s):
/// position x/y/z occupy the top three 16-bit lanes of `p0`; the quaternion
/// uses four 20-bit lanes, the first straddling the `p0`/`p1` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PosQuat128 {
    pub pos: [u16; 3],
    pub quat: [u32; 4],
}

impl PosQuat128 {
    pub fn unpack(p0: u64, p1: u64) -> Self {
        Self {
            pos: [(p0 >> 48) as u16, (p0 >> 32) as u16, (p0 >> 16) as u16],
            quat: [
                (((p0 & 0xFFFF) << 4) | (p1 >> 60)) as u32,
                ((p1 >> 40) & 0xFFFFF) as u32,
                ((p1 >> 20) & 0xFFFFF) as u32,
                (p1 & 0xFFFFF) as u32,
            ],
        }
    }

    pub fn pack(&self) -> (u64, u64) {
        let q = self.quat.map(|c| (c & 0xFFFFF) as u64);
        let p0 = ((self.pos[0] as u64) << 48)
            | ((self.pos[1] as u64) << 32)
            | ((self.pos[2] as u64) << 16)
            | (q[0] >> 4);
        let p1 = ((q[0] & 0xF) << 60) | (q[1] << 40) | (q[2] << 20) | q[3];
        (p0, p1)
    }

    /// Quantize a position inside `[min, max]` and a unit quaternion (xyzw).
    pub fn quantize(pos: [f32; 3], min: [f32; 3], max: [f32; 3], quat: [f32; 4]) -> Self {
        Self {
            pos: [0, 1, 2].map(|i| quantize(pos[i], 16, min[i], max[i]) as u16),
            quat: quat.map(|c| quantize(c, 20, -1.0, 1.0)),
        }
    }

    /// Decoded position inside the bounding box.
    pub fn position(&self, min: [f32; 3], max: [f32; 3]) -> [f32; 3] {
        [0, 1, 2].map(|i| decode_float16(self.pos[i] as u32, min[i], max[i]))
    }

    /// Decoded quaternion components (x, y, z, w) in `[-1, 1]`.
    pub fn rotation(&self) -> [f32; 4] {
        self.quat.map(|c| decode_float20(c, -1.0, 1.0))
    }
}

/// Decode an octahedral-encoded normal stored as two 8-bit lanes.
pub fn decode_normal_oct16(packed: u16) -> [f32; 3] {
    let fx = (packed & 0xFF) as f32 / 255.0 * 2.0 - 1.0;
    let fy = (packed >> 8) as f32 / 255.0 * 2.0 - 1.0;

    let mut n = [fx, fy, 1.0 - fx.abs() - fy.abs()];
    let t = (-n[2]).clamp(0.0, 1.0);
    n[0] += if n[0] >= 0.0 { -t } else { t };
    n[1] += if n[1] >= 0.0 { -t } else { t };

    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len > 0.0 {
        n.map(|c| c / len)
    } else {
        [0.0, 0.0, 1.0]
    }
}

/// Expand an RGB565 color to 8 bits per channel.
#[inline]
pub fn rgb565_to_rgb8(c: u16) -> [u8; 3] {
    let r = ((c >> 11) & 0x1F) as u8;
    let g = ((c >> 5) & 0x3F) as u8;
    let b = (c & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_quat_pack_unpack() {
        let src = PosQuat128 {
            pos: [0xABCD, 0x1234, 0xFFFF],
            quat: [0xFFFFF, 0x12345, 0x00001, 0x80000],
        };
        let (p0, p1) = src.pack();
        assert_eq!(PosQuat128::unpack(p0, p1), src);
    }

    #[test]
    fn test_pos_quat_bit_layout() {
        let p0 = 0x0001_0002_0003_ABCDu64;
        let p1 = 0xF000_0000_0000_0000u64;
        let pq = PosQuat128::unpack(p0, p1);
        assert_eq!(pq.pos, [1, 2, 3]);
        assert_eq!(pq.quat[0], (0xABCD << 4) | 0xF);
        assert_eq!(pq.quat[1], 0);
    }

    #[test]
    fn test_pos_quat_decoded_values() {
        let min = [-1.0, 0.0, 2.0];
        let max = [1.0, 4.0, 3.0];
        let pq = PosQuat128::quantize([0.5, 1.0, 2.5], min, max, [0.0, 0.0, 0.0, 1.0]);
        let pos = pq.position(min, max);
        assert!((pos[0] - 0.5).abs() < 1e-3);
        assert!((pos[1] - 1.0).abs() < 1e-3);
        assert!((pos[2] - 2.5).abs() < 1e-3);
        let rot = pq.rotation();
        assert!((rot[3] - 1.0).abs() < 1e-5);
        assert!(rot[0].abs() < 1e-5);
    }

    #[test]
    fn test_oct16_axis() {
        // (0.5, 0.5) in octahedral space is +Z
        let n = decode_normal_oct16(0x8080);
        assert!(n[2] > 0.99);
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        assert!((len - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rgb565() {
        assert_eq!(rgb565_to_rgb8(0xFFFF), [255, 255, 255]);
        assert_eq!(rgb565_to_rgb8(0xF800), [255, 0, 0]);
        assert_eq!(rgb565_to_rgb8(0x07E0), [0, 255, 0]);
        assert_eq!(rgb565_to_rgb8(0), [0, 0, 0]);
    }
}
