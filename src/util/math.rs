//! Math type re-exports and AVV-specific math utilities.
//!
//! This module re-exports types from `glam` and provides the quantization
//! bounds type shared by segments, frames and skeletons.

pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

use avv_codec::{decode_float16, quantize};
use bytemuck::{Pod, Zeroable};

/// Axis-aligned quantization bounds.
///
/// Positions inside a segment or skeleton are stored as 16-bit codes relative
/// to one of these boxes.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ZERO)
    }
}

impl Aabb {
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Build from the six floats stored in a container (`min[3]`, `max[3]`).
    #[inline]
    pub fn from_floats(v: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(v[0], v[1], v[2]),
            max: Vec3::new(v[3], v[4], v[5]),
        }
    }

    /// The six floats in container order.
    #[inline]
    pub fn to_floats(&self) -> [f32; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Decode three 16-bit codes into a point inside the box.
    #[inline]
    pub fn decode16(&self, x: u32, y: u32, z: u32) -> Vec3 {
        Vec3::new(
            decode_float16(x, self.min.x, self.max.x),
            decode_float16(y, self.min.y, self.max.y),
            decode_float16(z, self.min.z, self.max.z),
        )
    }

    /// Quantize a point to 16-bit codes relative to the box.
    #[inline]
    pub fn quantize16(&self, p: Vec3) -> [u16; 3] {
        [
            quantize(p.x, 16, self.min.x, self.max.x) as u16,
            quantize(p.y, 16, self.min.y, self.max.y) as u16,
            quantize(p.z, 16, self.min.z, self.max.z) as u16,
        ]
    }
}
