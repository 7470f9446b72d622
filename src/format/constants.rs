//! AVV container constants: magic, version and sub-container type tags.
//!
//! A type tag is a bitmask: one category bit (meta, segment or frame), zero
//! or more subcategory bits describing the attributes carried, and a 1-based
//! variant number in the low byte.

/// Magic bytes at the start of an AVV file.
pub const AVV_MAGIC: &[u8; 4] = b"AVV\0";

/// Supported container version, `(major << 16) | minor`.
pub const AVV_VERSION: u32 = (0 << 16) + 6;

/// Size of the `(type, size)` tag in front of every sub-container.
pub const TAG_SIZE: usize = 8;

/// Size of the file header (magic + version).
pub const FILE_HEADER_SIZE: usize = 8;

/// Mask selecting the variant number.
pub const VARIANT_MASK: u32 = 0xFF;

// ============================================================================
// Categories
// ============================================================================

pub const META: u32 = 1 << 8;
pub const SEGMENT: u32 = 1 << 9;
pub const FRAME: u32 = 1 << 10;

/// Mask covering all category bits.
pub const CATEGORY_MASK: u32 = META | SEGMENT | FRAME;

// ============================================================================
// Subcategories
// ============================================================================

pub const VERTEX_POS: u32 = 1 << 11;
pub const VERTEX_UVS: u32 = 1 << 12;
pub const VERTEX_NORMALS: u32 = 1 << 13;
pub const VERTEX_COLORS: u32 = 1 << 14;
pub const VERTEX_ANIM: u32 = 1 << 15;
pub const TRIS: u32 = 1 << 16;
pub const TEXTURE: u32 = 1 << 17;
pub const SKELETON: u32 = 1 << 18;
pub const MOTION_VECTORS: u32 = 1 << 19;

// ============================================================================
// Meta containers
// ============================================================================

pub const META_SEGMENT_TABLE: u32 = 0x01 | META;
pub const META_LIMITS: u32 = 0x02 | META;
pub const META_SKELETON: u32 = 0x03 | SKELETON | META;

// ============================================================================
// Segment containers
// ============================================================================

/// Top-level segment blob holding segment data plus its frames.
pub const SEGMENT_FRAMES: u32 = 0x01 | SEGMENT;

pub const SEGMENT_POS_16: u32 = 0x01 | VERTEX_POS | SEGMENT;
/// Legacy skinned positions with a run-length expansion list.
pub const SEGMENT_POS_SKIN_EXPAND_128: u32 = 0x01 | VERTEX_POS | VERTEX_ANIM | SEGMENT;
/// Skinned positions with an explicit vertex write table.
pub const SEGMENT_POS_SKIN_EXPAND_128_V2: u32 = 0x02 | VERTEX_POS | VERTEX_ANIM | SEGMENT;
pub const SEGMENT_UVS_12_NORMALS_888: u32 = 0x01 | VERTEX_UVS | VERTEX_NORMALS | SEGMENT;
pub const SEGMENT_UVS_16: u32 = 0x01 | VERTEX_UVS | SEGMENT;
pub const SEGMENT_TRIS_16: u32 = 0x01 | TRIS | SEGMENT;
pub const SEGMENT_TRIS_32: u32 = 0x02 | TRIS | SEGMENT;
pub const SEGMENT_TEXTURE_TRIS_16: u32 = 0x01 | TEXTURE | SEGMENT;
pub const SEGMENT_TEXTURE_TRIS_32: u32 = 0x02 | TEXTURE | SEGMENT;
pub const SEGMENT_TEXTURE_BLOCKS_32: u32 = 0x03 | TEXTURE | SEGMENT;
pub const SEGMENT_TEXTURE_BLOCKS_MULTIRES_32: u32 = 0x04 | TEXTURE | SEGMENT;
pub const SEGMENT_TEXTURE_VERTEX_MASK: u32 = 0x05 | TEXTURE | SEGMENT;
pub const SEGMENT_MOTION_VECTORS: u32 = 0x01 | MOTION_VECTORS | SEGMENT;

// ============================================================================
// Frame containers
// ============================================================================

pub const FRAME_ANIM_MAT4X4_32: u32 = 0x01 | VERTEX_ANIM | FRAME;
pub const FRAME_ANIM_POS_ROTATION_128: u32 = 0x02 | VERTEX_ANIM | FRAME;
pub const FRAME_ANIM_DELTA_POS_32: u32 = 0x03 | VERTEX_ANIM | FRAME;
pub const FRAME_TEXTURE_LUMA_8: u32 = 0x01 | TEXTURE | FRAME;
pub const FRAME_TEXTURE_LUMA_BC4: u32 = 0x02 | TEXTURE | FRAME;
pub const FRAME_COLORS_RGB_565: u32 = 0x01 | VERTEX_COLORS | FRAME;
pub const FRAME_COLORS_RGB_565_NORMALS_OCT_16: u32 =
    0x01 | VERTEX_COLORS | VERTEX_NORMALS | FRAME;

// ============================================================================
// Tag helpers
// ============================================================================

/// Category bits of a type tag.
#[inline]
pub const fn category(tag: u32) -> u32 {
    tag & CATEGORY_MASK
}

/// 1-based variant number of a type tag.
#[inline]
pub const fn variant(tag: u32) -> u32 {
    tag & VARIANT_MASK
}

/// Whether the tag carries all bits of `subcategory`.
#[inline]
pub const fn has_subcategory(tag: u32, subcategory: u32) -> bool {
    tag & subcategory == subcategory
}

/// Whether a frame sub-container holds luma texture data.
///
/// Texture sub-containers are split into their own streamable container at
/// import so they can be skipped for low detail levels.
#[inline]
pub const fn is_frame_texture(tag: u32) -> bool {
    tag == FRAME_TEXTURE_LUMA_8 || tag == FRAME_TEXTURE_LUMA_BC4
}

/// Human-readable version string (`major.minor`).
pub fn version_string(version: u32) -> String {
    format!("{}.{}", version >> 16, version & 0xFFFF)
}
