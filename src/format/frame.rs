//! Frame containers: per-frame animation, colors and luma texture updates.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::constants::*;
use super::header::Limits;
use super::read_util::{ByteReader, DataSpan};
use super::skeleton::{parse_pose, SkeletonPose};
use crate::pool::{BlockRef, UploadCounter, UploadGuard};
use crate::util::{Aabb, Error, Mat4, Result};

/// Quantized per-vertex position deltas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPositions {
    pub bounds: Aabb,
    pub count: u32,
    pub span: DataSpan,
}

/// Packed vertex colors, optionally carrying octahedral normals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorData {
    pub count: u32,
    /// `count` normals are interleaved with the colors (32 bits per vertex).
    pub with_normals: bool,
    pub span: DataSpan,
}

impl ColorData {
    pub fn normal_count(&self) -> u32 {
        if self.with_normals {
            self.count
        } else {
            0
        }
    }

    pub fn stride(&self) -> usize {
        if self.with_normals {
            4
        } else {
            2
        }
    }
}

/// Offsets and decoded animation parsed from a frame container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameLayout {
    /// Per-bone SSDR matrices (column major).
    pub bone_matrices: Vec<Mat4>,
    pub skeleton: Option<SkeletonPose>,
    pub delta_positions: Option<DeltaPositions>,
    pub colors: Option<ColorData>,
    pub skipped: u32,
}

impl FrameLayout {
    /// Walk a frame container (`frame_data_count` + sub-containers).
    pub fn parse(data: &[u8], limits: &Limits) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let count = r.u32()?;
        let mut layout = FrameLayout::default();

        for _ in 0..count {
            let (tag, mut p) = r.container()?;
            match tag.kind {
                FRAME_ANIM_MAT4X4_32 => {
                    let bones = p.counted(64)?;
                    Limits::check("bone", bones, limits.max_bone_count)?;
                    layout.bone_matrices = (0..bones)
                        .map(|_| p.f32_array::<16>().map(|m| Mat4::from_cols_array(&m)))
                        .collect::<Result<_>>()?;
                }
                FRAME_ANIM_POS_ROTATION_128 => {
                    let skeleton_index = p.u32()?;
                    let bones = p.u32()?;
                    Limits::check("bone", bones, limits.max_bone_count)?;
                    layout.skeleton = Some(parse_pose(&mut p, skeleton_index, bones)?);
                }
                FRAME_ANIM_DELTA_POS_32 => {
                    let bounds = p.aabb()?;
                    let count = p.u32()?;
                    let span = p.span(count as usize * 4)?;
                    layout.delta_positions = Some(DeltaPositions {
                        bounds,
                        count,
                        span,
                    });
                }
                FRAME_COLORS_RGB_565 | FRAME_COLORS_RGB_565_NORMALS_OCT_16 => {
                    let with_normals = tag.kind == FRAME_COLORS_RGB_565_NORMALS_OCT_16;
                    let count = p.u32()?;
                    let span = p.span(count as usize * if with_normals { 4 } else { 2 })?;
                    layout.colors = Some(ColorData {
                        count,
                        with_normals,
                        span,
                    });
                }
                other => {
                    debug!(kind = other, size = tag.size, "skipping frame sub-container");
                    layout.skipped += 1;
                }
            }
        }

        Ok(layout)
    }
}

/// Luma texture update carried in a frame's texture container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureLayout {
    /// Luma pixels covered by the update.
    pub luma_count: u32,
    /// BC4 blocks (8 bytes per 16 pixels) when set, raw 8-bit luma otherwise.
    pub block_compressed: bool,
    pub span: DataSpan,
}

impl TextureLayout {
    /// Parse a single tagged luma sub-container. Unknown types yield `None`.
    pub fn parse(data: &[u8], limits: &Limits) -> Result<Option<Self>> {
        let mut r = ByteReader::new(data);
        let (tag, mut p) = r.container()?;
        let layout = match tag.kind {
            FRAME_TEXTURE_LUMA_8 => {
                let luma_count = p.u32()?;
                Self {
                    luma_count,
                    block_compressed: false,
                    span: p.span(luma_count as usize)?,
                }
            }
            FRAME_TEXTURE_LUMA_BC4 => {
                let blocks = p.u32()?;
                Self {
                    luma_count: blocks.saturating_mul(16),
                    block_compressed: true,
                    span: p.span(blocks as usize * 8)?,
                }
            }
            other => {
                debug!(kind = other, "unknown frame texture container");
                return Ok(None);
            }
        };
        Limits::check("luma pixel", layout.luma_count, limits.max_luma_pixels)?;
        Ok(Some(layout))
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A parsed frame holding its content (and optional texture) blocks.
#[derive(Debug)]
pub struct Frame {
    pub frame_index: u32,
    pub layout: FrameLayout,
    pub texture: Option<TextureLayout>,
    content: BlockRef,
    content_len: usize,
    texture_content: Option<(BlockRef, usize)>,
    processed: AtomicBool,
    uploads: UploadCounter,
}

impl Frame {
    /// Parse the first `content_len` bytes of `content`.
    pub fn parse(
        frame_index: u32,
        content: BlockRef,
        content_len: usize,
        limits: &Limits,
    ) -> Result<Self> {
        let data = content
            .get(..content_len)
            .ok_or_else(|| Error::eof(0, content_len, content.len()))?;
        let layout = FrameLayout::parse(data, limits)?;
        Ok(Self {
            frame_index,
            layout,
            texture: None,
            content,
            content_len,
            texture_content: None,
            processed: AtomicBool::new(false),
            uploads: UploadCounter::default(),
        })
    }

    /// Parse and attach a texture container read into `block`.
    pub fn attach_texture(&mut self, block: BlockRef, len: usize, limits: &Limits) -> Result<()> {
        let data = block
            .get(..len)
            .ok_or_else(|| Error::eof(0, len, block.len()))?;
        self.texture = TextureLayout::parse(data, limits)?;
        if self.texture.is_some() {
            self.texture_content = Some((block, len));
        }
        Ok(())
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.content[..self.content_len]
    }

    #[inline]
    pub fn bytes(&self, span: DataSpan) -> &[u8] {
        &self.data()[span.offset..span.end()]
    }

    /// Packed color (and normal) bytes, if the frame has colors.
    pub fn color_bytes(&self) -> Option<&[u8]> {
        self.layout.colors.map(|c| self.bytes(c.span))
    }

    /// Luma bytes from the texture container, if one was attached.
    pub fn luma_bytes(&self) -> Option<&[u8]> {
        let texture = self.texture?;
        let (block, len) = self.texture_content.as_ref()?;
        Some(&block[..*len][texture.span.offset..texture.span.end()])
    }

    pub fn has_texture(&self) -> bool {
        self.texture.is_some()
    }

    /// Pool bytes held by this frame (content + texture).
    pub fn byte_size(&self) -> usize {
        self.content.size() + self.texture_content.as_ref().map_or(0, |(b, _)| b.size())
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

    /// Pin the frame content for an asynchronous consumer.
    pub fn begin_upload(&self) -> UploadGuard {
        self.uploads.acquire(self.content.clone(), self.content_len)
    }

    /// Pin the texture container, if present.
    pub fn begin_texture_upload(&self) -> Option<UploadGuard> {
        let (block, len) = self.texture_content.as_ref()?;
        Some(self.uploads.acquire(block.clone(), *len))
    }
}
