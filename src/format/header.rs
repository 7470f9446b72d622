//! Container header: segment table, limits and skeleton metadata.

use tracing::debug;

use super::constants::*;
use super::read_util::ByteReader;
use super::skeleton::{parse_skeleton, Skeleton};
use crate::util::{Error, Result};

/// One row of the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentTableEntry {
    pub byte_start: u32,
    pub byte_length: u32,
    pub frame_count: u32,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Global upper bounds declared by the encoder.
///
/// A zero field means the encoder did not declare that limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    pub max_container_size: u32,
    pub max_vertex_count: u32,
    pub max_index_count: u32,
    pub max_frame_count: u32,
    pub max_bone_count: u32,
    pub max_texture_width: u32,
    pub max_texture_height: u32,
    pub max_texture_triangles: u32,
    pub max_texture_blocks: u32,
    pub max_luma_pixels: u32,
}

impl Limits {
    /// Number of `u32` fields in the limits payload.
    pub const FIELD_COUNT: usize = 10;

    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            max_container_size: r.u32()?,
            max_vertex_count: r.u32()?,
            max_index_count: r.u32()?,
            max_frame_count: r.u32()?,
            max_bone_count: r.u32()?,
            max_texture_width: r.u32()?,
            max_texture_height: r.u32()?,
            max_texture_triangles: r.u32()?,
            max_texture_blocks: r.u32()?,
            max_luma_pixels: r.u32()?,
        })
    }

    /// Fields in payload order.
    pub fn to_words(&self) -> [u32; Self::FIELD_COUNT] {
        [
            self.max_container_size,
            self.max_vertex_count,
            self.max_index_count,
            self.max_frame_count,
            self.max_bone_count,
            self.max_texture_width,
            self.max_texture_height,
            self.max_texture_triangles,
            self.max_texture_blocks,
            self.max_luma_pixels,
        ]
    }

    /// Fail if `value` exceeds a declared (non-zero) `limit`.
    #[inline]
    pub fn check(what: &'static str, value: u32, limit: u32) -> Result<()> {
        if limit != 0 && value > limit {
            return Err(Error::LimitExceeded { what, value, limit });
        }
        Ok(())
    }
}

/// Parsed container header. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub version: u32,
    pub segment_table: Vec<SegmentTableEntry>,
    pub limits: Limits,
    pub skeleton: Option<Skeleton>,
}

impl Header {
    /// Parse the meta section, starting at `meta_container_count`.
    pub fn parse(version: u32, data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let count = r.u32()?;

        let mut header = Header {
            version,
            ..Default::default()
        };

        for _ in 0..count {
            let (tag, mut payload) = r.container()?;
            match tag.kind {
                META_SEGMENT_TABLE => {
                    let entries = payload.counted(20)?;
                    header.segment_table = (0..entries)
                        .map(|_| {
                            Ok(SegmentTableEntry {
                                byte_start: payload.u32()?,
                                byte_length: payload.u32()?,
                                frame_count: payload.u32()?,
                                vertex_count: payload.u32()?,
                                index_count: payload.u32()?,
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                META_LIMITS => header.limits = Limits::parse(&mut payload)?,
                META_SKELETON => header.skeleton = Some(parse_skeleton(&mut payload)?),
                other => debug!(kind = other, size = tag.size, "skipping unknown meta container"),
            }
        }

        Ok(header)
    }

    pub fn major_version(&self) -> u32 {
        self.version >> 16
    }

    pub fn minor_version(&self) -> u32 {
        self.version & 0xFFFF
    }

    pub fn version_string(&self) -> String {
        version_string(self.version)
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_table.len() as u32
    }

    /// Total frames across all segments.
    pub fn frame_count(&self) -> u32 {
        self.segment_table.iter().map(|e| e.frame_count).sum()
    }

    /// Largest vertex count of any segment.
    pub fn max_segment_vertices(&self) -> u32 {
        self.segment_table
            .iter()
            .map(|e| e.vertex_count)
            .max()
            .unwrap_or(0)
    }
}
