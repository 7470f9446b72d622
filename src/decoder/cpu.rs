//! CPU decode of segment geometry and frame colors.
//!
//! Produces flat, GPU-uploadable arrays from the quantized containers.
//! Work is split with rayon; run inside [`rayon::ThreadPool::install`] to
//! keep it on a specific pool.

use avv_codec::{decode_float12, decode_float16, decode_float8, decode_normal_oct16, rgb565_to_rgb8};
use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

use crate::format::segment::{POS16_PAIR_SIZE, SKINNED_VERTEX_SIZE};
use crate::format::{Frame, Segment, UvFormat, VertexEncoding};
use crate::util::{Aabb, Error, Result};

/// One output vertex, 32 bytes.
///
/// Position-only segments leave `bones` zero and put full weight on the
/// first slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DecodedVertex {
    pub position: [f32; 3],
    /// Four 8-bit bone indices.
    pub bones: u32,
    pub weights: [f32; 4],
}

/// Decoded segment geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMesh {
    pub segment_index: u32,
    pub bounds: Aabb,
    pub skinned: bool,
    pub vertices: Vec<DecodedVertex>,
    pub indices: Vec<u32>,
    pub uvs: Vec<[f16; 2]>,
    /// Present for the uv12 + normal888 layout.
    pub normals: Vec<[f32; 3]>,
}

impl DecodedMesh {
    /// Vertex buffer bytes, ready for upload.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }
}

/// Decoded per-frame vertex colors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedColors {
    pub frame_index: u32,
    /// RGBA8, alpha always 255.
    pub colors: Vec<[u8; 4]>,
    pub normals: Vec<[f32; 3]>,
}

#[inline]
fn word(bytes: &[u8], i: usize) -> u32 {
    LittleEndian::read_u32(&bytes[i * 4..i * 4 + 4])
}

/// Decode everything a segment carries.
#[tracing::instrument(skip_all, fields(segment = segment.segment_index))]
pub fn decode_segment(segment: &Segment) -> Result<DecodedMesh> {
    let layout = &segment.layout;
    let mut mesh = DecodedMesh {
        segment_index: segment.segment_index,
        bounds: layout.aabb,
        skinned: layout.is_skinned(),
        ..Default::default()
    };

    if let Some(vertices) = &layout.vertices {
        mesh.vertices = match vertices.encoding {
            VertexEncoding::Pos16 => decode_pos16(segment.bytes(vertices.span), layout.aabb, layout.vertex_count),
            VertexEncoding::Skinned | VertexEncoding::SkinnedLegacy => decode_skinned(segment)?,
        };
    }

    if let Some(indices) = layout.indices {
        let bytes = segment.bytes(indices.span);
        let count = indices.count as usize;
        mesh.indices = if indices.wide {
            bytes[..count * 4]
                .par_chunks_exact(4)
                .map(LittleEndian::read_u32)
                .collect()
        } else {
            bytes[..count * 2]
                .par_chunks_exact(2)
                .map(|c| u32::from(LittleEndian::read_u16(c)))
                .collect()
        };
    }

    if let Some(uvs) = layout.uvs {
        let bytes = segment.bytes(uvs.span);
        let count = uvs.count as usize;
        match uvs.format {
            UvFormat::Uv16 => {
                mesh.uvs = bytes[..count * 4]
                    .par_chunks_exact(4)
                    .map(|c| {
                        let w = LittleEndian::read_u32(c);
                        [
                            f16::from_f32(decode_float16(w & 0xFFFF, 0.0, 1.0)),
                            f16::from_f32(decode_float16(w >> 16, 0.0, 1.0)),
                        ]
                    })
                    .collect();
            }
            UvFormat::Uv12Normal888 => {
                let (uvs, normals) = decode_uv12_normals(&bytes[..count.div_ceil(2) * 12], count);
                mesh.uvs = uvs;
                mesh.normals = normals;
            }
        }
    }

    Ok(mesh)
}

/// Two vertices per 12 bytes: `x0 y0 | z0 x1 | y1 z1`.
fn decode_pos16(bytes: &[u8], bounds: Aabb, vertex_count: u32) -> Vec<DecodedVertex> {
    let count = vertex_count as usize;
    let pairs = count.div_ceil(2);
    let mut out = vec![DecodedVertex::zeroed(); pairs * 2];
    out.par_chunks_mut(2)
        .zip(bytes[..pairs * POS16_PAIR_SIZE].par_chunks_exact(POS16_PAIR_SIZE))
        .for_each(|(dst, src)| {
            let (w0, w1, w2) = (word(src, 0), word(src, 1), word(src, 2));
            let a = bounds.decode16(w0 & 0xFFFF, w0 >> 16, w1 & 0xFFFF);
            let b = bounds.decode16(w1 >> 16, w2 & 0xFFFF, w2 >> 16);
            for (v, p) in dst.iter_mut().zip([a, b]) {
                *v = DecodedVertex {
                    position: p.to_array(),
                    bones: 0,
                    weights: [1.0, 0.0, 0.0, 0.0],
                };
            }
        });
    out.truncate(count);
    out
}

/// Decode compact skinned vertices and scatter them through the expansion table.
fn decode_skinned(segment: &Segment) -> Result<Vec<DecodedVertex>> {
    let layout = &segment.layout;
    let Some(vertices) = &layout.vertices else {
        return Ok(Vec::new());
    };
    let compact_count = layout.compact_vertex_count as usize;
    let bounds = layout.aabb;
    let bytes = segment.bytes(vertices.span);

    let compact: Vec<DecodedVertex> = bytes[..compact_count * SKINNED_VERTEX_SIZE]
        .par_chunks_exact(SKINNED_VERTEX_SIZE)
        .map(|src| {
            let (w0, w1, w2, w3) = (word(src, 0), word(src, 1), word(src, 2), word(src, 3));
            let p = bounds.decode16(w0 & 0xFFFF, w0 >> 16, w1 & 0xFFFF);
            let a = decode_float16(w1 >> 16, 0.0, 1.0);
            let b = decode_float16(w2 & 0xFFFF, 0.0, 1.0);
            let c = decode_float16(w2 >> 16, 0.0, 1.0);
            DecodedVertex {
                position: p.to_array(),
                bones: w3,
                weights: complete_weights(a, b, c),
            }
        })
        .collect();

    let mut out = vec![DecodedVertex::zeroed(); layout.vertex_count as usize];
    for (v, vertex) in compact.iter().enumerate() {
        let (count, offset) = segment
            .expansion_entry(v)
            .ok_or_else(|| Error::invalid(format!("no expansion entry for compact vertex {v}")))?;
        let start = offset as usize;
        let dst = out.get_mut(start..start + count as usize).ok_or_else(|| {
            Error::invalid(format!(
                "expansion of vertex {v} writes past {} vertices",
                layout.vertex_count
            ))
        })?;
        dst.fill(*vertex);
    }
    Ok(out)
}

/// Residual weight at or below which the fourth influence is dropped.
const MIN_FOURTH_WEIGHT: f32 = 3.0 / 2046.0;

/// Derive the fourth bone weight from the three stored ones.
///
/// A residual within quantization noise is folded into the first weight.
fn complete_weights(a: f32, b: f32, c: f32) -> [f32; 4] {
    let d = 1.0 - (a + b + c);
    if d <= MIN_FOURTH_WEIGHT {
        [a + d, b, c, 0.0]
    } else {
        [a, b, c, d]
    }
}

/// Two vertices per 12 bytes of 12-bit uvs and 8:8:8 normals (x, z, y order).
fn decode_uv12_normals(bytes: &[u8], count: usize) -> (Vec<[f16; 2]>, Vec<[f32; 3]>) {
    let uv = |x: u32| f16::from_f32(decode_float12(x & 0xFFF, 0.0, 1.0));
    let n = |x: u32| decode_float8(x & 0xFF, -1.0, 1.0);

    let pairs: Vec<[([f16; 2], [f32; 3]); 2]> = bytes
        .par_chunks_exact(12)
        .map(|src| {
            let (w0, w1, w2) = (word(src, 0), word(src, 1), word(src, 2));
            let v1 = (w1 >> 28) | ((w2 & 0xFF) << 4);
            [
                ([uv(w0), uv(w0 >> 12)], [n(w0 >> 24), n(w1 >> 8), n(w1)]),
                ([uv(w1 >> 16), uv(v1)], [n(w2 >> 8), n(w2 >> 24), n(w2 >> 16)]),
            ]
        })
        .collect();

    pairs.into_iter().flatten().take(count).unzip()
}

/// Decode a frame's packed colors (and normals), if it has any.
pub fn decode_frame_colors(frame: &Frame) -> Option<DecodedColors> {
    let colors = frame.layout.colors?;
    let bytes = frame.color_bytes()?;
    let count = colors.count as usize;
    let stride = colors.stride();

    let decoded: Vec<([u8; 4], Option<[f32; 3]>)> = bytes[..count * stride]
        .par_chunks_exact(stride)
        .map(|c| {
            let [r, g, b] = rgb565_to_rgb8(LittleEndian::read_u16(c));
            let normal = colors
                .with_normals
                .then(|| decode_normal_oct16(LittleEndian::read_u16(&c[2..])));
            ([r, g, b, 255], normal)
        })
        .collect();

    let mut out = DecodedColors {
        frame_index: frame.frame_index,
        colors: Vec::with_capacity(count),
        normals: Vec::with_capacity(colors.normal_count() as usize),
    };
    for (color, normal) in decoded {
        out.colors.push(color);
        out.normals.extend(normal);
    }
    Some(out)
}
