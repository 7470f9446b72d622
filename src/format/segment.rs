//! Segment containers: geometry shared by a contiguous span of frames.

use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::constants::*;
use super::expansion::{validate_table_entries, ExpansionTable, MAX_WRITE_OFFSET};
use super::header::Limits;
use super::read_util::{ByteReader, DataSpan};
use crate::pool::{BlockRef, UploadCounter, UploadGuard};
use crate::util::{Aabb, Error, Result};

/// Bytes per compact skinned vertex (pos 3x16, weights 3x16, bone indices 32).
pub const SKINNED_VERTEX_SIZE: usize = 16;

/// Bytes per pair of position-only vertices (2 x 48 bits).
pub const POS16_PAIR_SIZE: usize = 12;

/// How vertex positions are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexEncoding {
    /// 16-bit quantized positions, no skinning.
    Pos16,
    /// Skinned positions, legacy run-length expansion list.
    SkinnedLegacy,
    /// Skinned positions with an explicit write table.
    Skinned,
}

/// Where a skinned segment's expansion table comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Position-only segments expand one to one.
    Identity,
    /// Table built from a legacy run-length list while parsing.
    Materialized(ExpansionTable),
    /// Packed write table stored inside the segment bytes.
    WriteTable(DataSpan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexData {
    pub encoding: VertexEncoding,
    pub span: DataSpan,
    pub expansion: Expansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexData {
    pub count: u32,
    /// 32-bit indices when set, 16-bit otherwise.
    pub wide: bool,
    pub span: DataSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvFormat {
    /// Two 16-bit uv components per vertex.
    Uv16,
    /// 12-bit uvs plus an 8:8:8 normal, packed in pairs.
    Uv12Normal888,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvData {
    pub count: u32,
    pub format: UvFormat,
    pub span: DataSpan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBlocks {
    pub block_count: u32,
    pub width: u32,
    pub height: u32,
    /// Per-mip block counts for multi-resolution textures.
    pub level_block_counts: Vec<u32>,
    pub span: DataSpan,
}

impl TextureBlocks {
    pub fn is_multires(&self) -> bool {
        !self.level_block_counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionVectors {
    pub bounds: Aabb,
    pub count: u32,
    pub span: DataSpan,
}

/// Offsets and counts parsed from a segment container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentLayout {
    pub vertex_count: u32,
    pub compact_vertex_count: u32,
    pub aabb: Aabb,
    pub vertices: Option<VertexData>,
    pub indices: Option<IndexData>,
    pub uvs: Option<UvData>,
    pub texture: Option<TextureBlocks>,
    pub motion_vectors: Option<MotionVectors>,
    /// Unknown sub-containers skipped while parsing.
    pub skipped: u32,
}

fn require(span: DataSpan, needed: usize, what: &str) -> Result<()> {
    if span.len < needed {
        return Err(Error::invalid(format!(
            "{what} data holds {} bytes, {needed} required",
            span.len
        )));
    }
    Ok(())
}

impl SegmentLayout {
    /// Walk a segment container (`segment_data_count` + sub-containers).
    pub fn parse(data: &[u8], limits: &Limits) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let count = r.u32()?;
        let mut layout = SegmentLayout::default();

        for _ in 0..count {
            let (tag, mut p) = r.container()?;
            match tag.kind {
                SEGMENT_POS_16 => {
                    layout.aabb = p.aabb()?;
                    let vertex_count = p.u32()?;
                    Limits::check("vertex", vertex_count, limits.max_vertex_count)?;
                    let span = p.rest_span();
                    require(span, (vertex_count as usize).div_ceil(2) * POS16_PAIR_SIZE, "position")?;
                    layout.vertex_count = vertex_count;
                    layout.compact_vertex_count = vertex_count;
                    layout.vertices = Some(VertexData {
                        encoding: VertexEncoding::Pos16,
                        span,
                        expansion: Expansion::Identity,
                    });
                }
                SEGMENT_POS_SKIN_EXPAND_128 => {
                    layout.aabb = p.aabb()?;
                    let (vertex_count, compact) = skinned_counts(&mut p, limits)?;
                    let list_count = p.u32()?;
                    let list = p.bytes(list_count as usize)?;
                    if (list_count as usize) < compact as usize {
                        return Err(Error::invalid(format!(
                            "expansion list has {list_count} entries for {compact} compact vertices"
                        )));
                    }
                    let table = ExpansionTable::from_run_lengths(&list[..compact as usize])?;
                    if table.expanded_len() > vertex_count as u64 {
                        return Err(Error::invalid(format!(
                            "expansion list expands to {} vertices, segment has {vertex_count}",
                            table.expanded_len()
                        )));
                    }
                    let span = p.rest_span();
                    require(span, compact as usize * SKINNED_VERTEX_SIZE, "skinned vertex")?;
                    layout.vertex_count = vertex_count;
                    layout.compact_vertex_count = compact;
                    layout.vertices = Some(VertexData {
                        encoding: VertexEncoding::SkinnedLegacy,
                        span,
                        expansion: Expansion::Materialized(table),
                    });
                }
                SEGMENT_POS_SKIN_EXPAND_128_V2 => {
                    layout.aabb = p.aabb()?;
                    let (vertex_count, compact) = skinned_counts(&mut p, limits)?;
                    let table_span = p.span(compact as usize * 4)?;
                    validate_table_entries(table_span.slice(data)?, vertex_count)?;
                    let span = p.rest_span();
                    require(span, compact as usize * SKINNED_VERTEX_SIZE, "skinned vertex")?;
                    layout.vertex_count = vertex_count;
                    layout.compact_vertex_count = compact;
                    layout.vertices = Some(VertexData {
                        encoding: VertexEncoding::Skinned,
                        span,
                        expansion: Expansion::WriteTable(table_span),
                    });
                }
                SEGMENT_TRIS_16 | SEGMENT_TRIS_32 => {
                    let wide = tag.kind == SEGMENT_TRIS_32;
                    let count = p.u32()?;
                    Limits::check("index", count, limits.max_index_count)?;
                    let span = p.rest_span();
                    require(span, count as usize * if wide { 4 } else { 2 }, "index")?;
                    layout.indices = Some(IndexData { count, wide, span });
                }
                SEGMENT_UVS_16 => {
                    let count = p.u32()?;
                    let span = p.rest_span();
                    require(span, count as usize * 4, "uv")?;
                    layout.uvs = Some(UvData {
                        count,
                        format: UvFormat::Uv16,
                        span,
                    });
                }
                SEGMENT_UVS_12_NORMALS_888 => {
                    let count = p.u32()?;
                    let span = p.rest_span();
                    require(span, (count as usize).div_ceil(2) * 12, "uv/normal")?;
                    layout.uvs = Some(UvData {
                        count,
                        format: UvFormat::Uv12Normal888,
                        span,
                    });
                }
                SEGMENT_TEXTURE_BLOCKS_32 | SEGMENT_TEXTURE_BLOCKS_MULTIRES_32 => {
                    let block_count = p.u32()?;
                    Limits::check("texture block", block_count, limits.max_texture_blocks)?;
                    let width_height = p.u32()?;
                    let (width, height) = (width_height >> 16, width_height & 0xFFFF);
                    Limits::check("texture width", width, limits.max_texture_width)?;
                    Limits::check("texture height", height, limits.max_texture_height)?;
                    let mut level_block_counts = Vec::new();
                    if tag.kind == SEGMENT_TEXTURE_BLOCKS_MULTIRES_32 {
                        let levels = p.counted(4)?;
                        for _ in 0..levels {
                            level_block_counts.push(p.u32()?);
                        }
                    }
                    let span = p.span(block_count as usize * 4)?;
                    layout.texture = Some(TextureBlocks {
                        block_count,
                        width,
                        height,
                        level_block_counts,
                        span,
                    });
                }
                SEGMENT_MOTION_VECTORS => {
                    let bounds = p.aabb()?;
                    let count = p.u32()?;
                    let span = p.rest_span();
                    require(span, count as usize * 4, "motion vector")?;
                    layout.motion_vectors = Some(MotionVectors {
                        bounds,
                        count,
                        span,
                    });
                }
                other => {
                    debug!(kind = other, size = tag.size, "skipping segment sub-container");
                    layout.skipped += 1;
                }
            }
        }

        Ok(layout)
    }

    /// Whether vertices carry skinning weights.
    pub fn is_skinned(&self) -> bool {
        matches!(
            self.vertices.as_ref().map(|v| v.encoding),
            Some(VertexEncoding::Skinned | VertexEncoding::SkinnedLegacy)
        )
    }
}

fn skinned_counts(p: &mut ByteReader<'_>, limits: &Limits) -> Result<(u32, u32)> {
    let vertex_count = p.u32()?;
    let compact = p.u32()?;
    Limits::check("vertex", vertex_count, limits.max_vertex_count)?;
    if vertex_count > MAX_WRITE_OFFSET + 1 {
        return Err(Error::invalid(format!(
            "vertex count {vertex_count} exceeds the 24-bit write offset range"
        )));
    }
    if compact > vertex_count {
        return Err(Error::invalid(format!(
            "compact vertex count {compact} exceeds vertex count {vertex_count}"
        )));
    }
    Ok((vertex_count, compact))
}

// ============================================================================
// Segment
// ============================================================================

/// A parsed segment holding its raw bytes in a pool block.
#[derive(Debug)]
pub struct Segment {
    pub segment_index: u32,
    pub layout: SegmentLayout,
    content: BlockRef,
    content_len: usize,
    processed: AtomicBool,
    uploads: UploadCounter,
}

impl Segment {
    /// Parse the first `content_len` bytes of `content`.
    pub fn parse(
        segment_index: u32,
        content: BlockRef,
        content_len: usize,
        limits: &Limits,
    ) -> Result<Self> {
        let data = content
            .get(..content_len)
            .ok_or_else(|| Error::eof(0, content_len, content.len()))?;
        let layout = SegmentLayout::parse(data, limits)?;
        Ok(Self {
            segment_index,
            layout,
            content,
            content_len,
            processed: AtomicBool::new(false),
            uploads: UploadCounter::default(),
        })
    }

    /// Raw container bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.content[..self.content_len]
    }

    /// Bytes covered by `span`. Spans come from parsing, so they are in range.
    #[inline]
    pub fn bytes(&self, span: DataSpan) -> &[u8] {
        &self.data()[span.offset..span.end()]
    }

    /// Expansion entry `(count, write_offset)` of compact vertex `v`.
    pub fn expansion_entry(&self, v: usize) -> Option<(u32, u32)> {
        let vertices = self.layout.vertices.as_ref()?;
        match &vertices.expansion {
            Expansion::Identity => Some((1, v as u32)),
            Expansion::Materialized(table) => table.entry(v),
            Expansion::WriteTable(span) => {
                let bytes = self.bytes(*span).get(v * 4..v * 4 + 4)?;
                Some(super::expansion::unpack_entry(LittleEndian::read_u32(bytes)))
            }
        }
    }

    /// The full expansion table, materialised from whichever source backs it.
    pub fn expansion_table(&self) -> Option<ExpansionTable> {
        let vertices = self.layout.vertices.as_ref()?;
        match &vertices.expansion {
            Expansion::Identity => None,
            Expansion::Materialized(table) => Some(table.clone()),
            Expansion::WriteTable(span) => Some(ExpansionTable::from_le_bytes(self.bytes(*span))),
        }
    }

    #[inline]
    pub fn block(&self) -> &BlockRef {
        &self.content
    }

    /// Pool bytes held by this segment.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.content.size()
    }

    #[inline]
    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn active_uploads(&self) -> usize {
        self.uploads.count()
    }

    /// Pin the segment bytes for an asynchronous consumer.
    ///
    /// The cache will not evict this segment until the guard is dropped.
    pub fn begin_upload(&self) -> UploadGuard {
        self.uploads.acquire(self.content.clone(), self.content_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::writer::SegmentBuilder;
    use crate::util::Vec3;

    fn bounds() -> Aabb {
        Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0))
    }

    #[test]
    fn test_parse_pos16_and_tris() {
        let data = SegmentBuilder::new()
            .pos16(bounds(), &[Vec3::ZERO, Vec3::ONE, Vec3::NEG_ONE])
            .tris16(&[0, 1, 2])
            .uvs16(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]])
            .build();
        let layout = SegmentLayout::parse(&data, &Limits::default()).unwrap();
        assert_eq!(layout.vertex_count, 3);
        assert_eq!(layout.compact_vertex_count, 3);
        assert!(!layout.is_skinned());
        let idx = layout.indices.unwrap();
        assert_eq!((idx.count, idx.wide), (3, false));
        assert_eq!(layout.uvs.unwrap().format, UvFormat::Uv16);
    }

    #[test]
    fn test_unknown_sub_container_skipped() {
        let data = SegmentBuilder::new()
            .raw(0x7F | SEGMENT, &[0xAB; 13])
            .tris32(&[0, 1, 2, 2, 1, 0])
            .build();
        let layout = SegmentLayout::parse(&data, &Limits::default()).unwrap();
        assert_eq!(layout.skipped, 1);
        let idx = layout.indices.unwrap();
        assert_eq!((idx.count, idx.wide), (6, true));
        // tag of the skipped container (8) + its 13 bytes + count (4) + tris tag (8) + count (4)
        assert_eq!(idx.span.offset, 4 + 8 + 13 + 8 + 4);
    }

    #[test]
    fn test_limits_enforced() {
        let data = SegmentBuilder::new()
            .pos16(bounds(), &[Vec3::ZERO; 4])
            .build();
        let limits = Limits {
            max_vertex_count: 3,
            ..Default::default()
        };
        assert!(matches!(
            SegmentLayout::parse(&data, &limits),
            Err(Error::LimitExceeded { what: "vertex", .. })
        ));
    }

    #[test]
    fn test_truncated_vertex_data() {
        let mut data = SegmentBuilder::new()
            .pos16(bounds(), &[Vec3::ZERO; 4])
            .build();
        // Shrink the advertised size and the payload together
        let size = u32::from_le_bytes(data[8..12].try_into().unwrap());
        data[8..12].copy_from_slice(&(size - 12).to_le_bytes());
        data.truncate(data.len() - 12);
        assert!(SegmentLayout::parse(&data, &Limits::default()).is_err());
    }

    #[test]
    fn test_texture_blocks_multires() {
        let data = SegmentBuilder::new()
            .texture_blocks(512, 256, &[1, 2, 3, 4, 5], &[4, 1])
            .build();
        let layout = SegmentLayout::parse(&data, &Limits::default()).unwrap();
        let tex = layout.texture.unwrap();
        assert_eq!((tex.width, tex.height, tex.block_count), (512, 256, 5));
        assert!(tex.is_multires());
        assert_eq!(tex.level_block_counts, vec![4, 1]);
        assert_eq!(tex.span.len, 20);
    }
}
