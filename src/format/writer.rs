//! AVV stream writer.
//!
//! Builders for meta, segment, frame and texture containers plus
//! [`AvvWriter`], which assembles them into a complete AVV byte stream. The
//! encoder side of the player is out of scope; these exist so tooling and
//! tests can produce well-formed (or deliberately malformed) containers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use avv_codec::{quantize, PosQuat128};

use super::constants::*;
use super::expansion::ExpansionTable;
use super::header::{Limits, SegmentTableEntry};
use super::segment::SegmentLayout;
use super::skeleton::{BoneInfo, BONE_NAME_LEN};
use crate::util::{Aabb, Mat4, Quat, Result, Vec3};

#[inline]
fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Append a `(type, size, payload)` sub-container.
pub fn push_container(out: &mut Vec<u8>, kind: u32, payload: &[u8]) {
    put_u32(out, kind);
    put_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Ordered list of sub-containers, serialised as `count` + containers.
#[derive(Debug, Clone, Default)]
struct ContainerList {
    entries: Vec<(u32, Vec<u8>)>,
}

impl ContainerList {
    fn push(&mut self, kind: u32, payload: Vec<u8>) {
        self.entries.push((kind, payload));
    }

    fn build(&self) -> Vec<u8> {
        let total: usize = self.entries.iter().map(|(_, p)| p.len() + TAG_SIZE).sum();
        let mut out = Vec::with_capacity(4 + total);
        put_u32(&mut out, self.entries.len() as u32);
        for (kind, payload) in &self.entries {
            push_container(&mut out, *kind, payload);
        }
        out
    }
}

// ============================================================================
// Meta
// ============================================================================

/// Builds the meta section (`meta_container_count` + containers).
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    list: ContainerList,
}

impl MetaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_table(mut self, entries: &[SegmentTableEntry]) -> Self {
        let mut p = Vec::with_capacity(4 + entries.len() * 20);
        put_u32(&mut p, entries.len() as u32);
        for e in entries {
            for v in [e.byte_start, e.byte_length, e.frame_count, e.vertex_count, e.index_count] {
                put_u32(&mut p, v);
            }
        }
        self.list.push(META_SEGMENT_TABLE, p);
        self
    }

    pub fn limits(mut self, limits: &Limits) -> Self {
        let mut p = Vec::with_capacity(Limits::FIELD_COUNT * 4);
        for v in limits.to_words() {
            put_u32(&mut p, v);
        }
        self.list.push(META_LIMITS, p);
        self
    }

    /// Skeleton with its reference pose (one position/rotation per bone).
    pub fn skeleton(
        mut self,
        skeleton_index: u32,
        bones: &[BoneInfo],
        bounds: Aabb,
        pose: &[(Vec3, Quat)],
    ) -> Self {
        let mut p = Vec::new();
        put_u32(&mut p, skeleton_index);
        put_u32(&mut p, bones.len() as u32);
        for bone in bones {
            p.extend_from_slice(&bone.parent.to_le_bytes());
            let mut name = [0u8; BONE_NAME_LEN];
            let n = bone.name.len().min(BONE_NAME_LEN - 1);
            name[..n].copy_from_slice(&bone.name.as_bytes()[..n]);
            p.extend_from_slice(&name);
        }
        encode_pose(&mut p, bounds, pose);
        self.list.push(META_SKELETON, p);
        self
    }

    pub fn raw(mut self, kind: u32, payload: &[u8]) -> Self {
        self.list.push(kind, payload.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.list.build()
    }
}

fn encode_pose(out: &mut Vec<u8>, bounds: Aabb, pose: &[(Vec3, Quat)]) {
    put_f32s(out, &bounds.to_floats());
    let (min, max) = (bounds.min.to_array(), bounds.max.to_array());
    for (pos, rot) in pose {
        let (p0, p1) = PosQuat128::quantize(pos.to_array(), min, max, rot.to_array()).pack();
        out.extend_from_slice(&p0.to_le_bytes());
        out.extend_from_slice(&p1.to_le_bytes());
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Compact skinned vertex: position, three explicit weights, packed bones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkinnedVertex {
    pub position: Vec3,
    pub weights: [f32; 3],
    /// Four 8-bit bone indices.
    pub bones: u32,
}

/// Builds a segment container (`segment_data_count` + containers).
#[derive(Debug, Clone, Default)]
pub struct SegmentBuilder {
    list: ContainerList,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pos16(mut self, bounds: Aabb, positions: &[Vec3]) -> Self {
        let mut p = Vec::new();
        put_f32s(&mut p, &bounds.to_floats());
        put_u32(&mut p, positions.len() as u32);
        for pair in positions.chunks(2) {
            let a = bounds.quantize16(pair[0]);
            let b = pair.get(1).map_or([0; 3], |v| bounds.quantize16(*v));
            put_u32(&mut p, a[0] as u32 | (a[1] as u32) << 16);
            put_u32(&mut p, a[2] as u32 | (b[0] as u32) << 16);
            put_u32(&mut p, b[1] as u32 | (b[2] as u32) << 16);
        }
        self.list.push(SEGMENT_POS_16, p);
        self
    }

    /// Legacy skinned container with a run-length expansion list.
    pub fn skinned_v1(self, bounds: Aabb, vertices: &[SkinnedVertex], counts: &[u8]) -> Self {
        self.skinned(bounds, vertices, counts, true)
    }

    /// Skinned container with an explicit write table.
    pub fn skinned_v2(self, bounds: Aabb, vertices: &[SkinnedVertex], counts: &[u8]) -> Self {
        self.skinned(bounds, vertices, counts, false)
    }

    fn skinned(
        mut self,
        bounds: Aabb,
        vertices: &[SkinnedVertex],
        counts: &[u8],
        legacy: bool,
    ) -> Self {
        let expanded: u32 = counts.iter().map(|&c| c as u32).sum();
        let mut p = Vec::new();
        put_f32s(&mut p, &bounds.to_floats());
        put_u32(&mut p, expanded);
        put_u32(&mut p, vertices.len() as u32);
        if legacy {
            put_u32(&mut p, counts.len() as u32);
            p.extend_from_slice(counts);
        } else {
            // Out-of-range offsets write an empty table
            let table = ExpansionTable::from_run_lengths(counts).unwrap_or_default();
            p.extend_from_slice(&table.to_le_bytes());
        }
        for v in vertices {
            let pos = bounds.quantize16(v.position);
            let w = v.weights.map(|w| quantize(w, 16, 0.0, 1.0));
            put_u32(&mut p, pos[0] as u32 | (pos[1] as u32) << 16);
            put_u32(&mut p, pos[2] as u32 | w[0] << 16);
            put_u32(&mut p, w[1] | w[2] << 16);
            put_u32(&mut p, v.bones);
        }
        let kind = if legacy {
            SEGMENT_POS_SKIN_EXPAND_128
        } else {
            SEGMENT_POS_SKIN_EXPAND_128_V2
        };
        self.list.push(kind, p);
        self
    }

    pub fn tris16(mut self, indices: &[u16]) -> Self {
        let mut p = Vec::with_capacity(4 + indices.len() * 2);
        put_u32(&mut p, indices.len() as u32);
        for i in indices {
            p.extend_from_slice(&i.to_le_bytes());
        }
        self.list.push(SEGMENT_TRIS_16, p);
        self
    }

    pub fn tris32(mut self, indices: &[u32]) -> Self {
        let mut p = Vec::with_capacity(4 + indices.len() * 4);
        put_u32(&mut p, indices.len() as u32);
        for &i in indices {
            put_u32(&mut p, i);
        }
        self.list.push(SEGMENT_TRIS_32, p);
        self
    }

    pub fn uvs16(mut self, uvs: &[[f32; 2]]) -> Self {
        let mut p = Vec::with_capacity(4 + uvs.len() * 4);
        put_u32(&mut p, uvs.len() as u32);
        for uv in uvs {
            put_u32(
                &mut p,
                quantize(uv[0], 16, 0.0, 1.0) | quantize(uv[1], 16, 0.0, 1.0) << 16,
            );
        }
        self.list.push(SEGMENT_UVS_16, p);
        self
    }

    /// 12-bit uvs with 8:8:8 normals, packed two vertices per 12 bytes.
    pub fn uvs12_normals888(mut self, uvs: &[[f32; 2]], normals: &[Vec3]) -> Self {
        let q12 = |x: f32| quantize(x, 12, 0.0, 1.0);
        let q8 = |x: f32| quantize(x, 8, -1.0, 1.0);
        let mut p = Vec::new();
        put_u32(&mut p, uvs.len() as u32);
        for (i, pair) in uvs.chunks(2).enumerate() {
            let n0 = normals.get(i * 2).copied().unwrap_or(Vec3::Z);
            let n1 = normals.get(i * 2 + 1).copied().unwrap_or(Vec3::Z);
            let uv1 = pair.get(1).copied().unwrap_or([0.0, 0.0]);
            let (u0, v0, u1, v1) = (q12(pair[0][0]), q12(pair[0][1]), q12(uv1[0]), q12(uv1[1]));
            put_u32(&mut p, u0 | v0 << 12 | q8(n0.x) << 24);
            put_u32(&mut p, q8(n0.z) | q8(n0.y) << 8 | u1 << 16 | (v1 & 0xF) << 28);
            put_u32(&mut p, (v1 >> 4) | q8(n1.x) << 8 | q8(n1.z) << 16 | q8(n1.y) << 24);
        }
        self.list.push(SEGMENT_UVS_12_NORMALS_888, p);
        self
    }

    /// Texture block list; a non-empty `levels` writes the multi-resolution variant.
    pub fn texture_blocks(mut self, width: u32, height: u32, blocks: &[u32], levels: &[u32]) -> Self {
        let mut p = Vec::new();
        put_u32(&mut p, blocks.len() as u32);
        put_u32(&mut p, (width << 16) | (height & 0xFFFF));
        if !levels.is_empty() {
            put_u32(&mut p, levels.len() as u32);
            for &l in levels {
                put_u32(&mut p, l);
            }
        }
        for &b in blocks {
            put_u32(&mut p, b);
        }
        let kind = if levels.is_empty() {
            SEGMENT_TEXTURE_BLOCKS_32
        } else {
            SEGMENT_TEXTURE_BLOCKS_MULTIRES_32
        };
        self.list.push(kind, p);
        self
    }

    pub fn motion_vectors(mut self, bounds: Aabb, vectors: &[u32]) -> Self {
        let mut p = Vec::new();
        put_f32s(&mut p, &bounds.to_floats());
        put_u32(&mut p, vectors.len() as u32);
        for &v in vectors {
            put_u32(&mut p, v);
        }
        self.list.push(SEGMENT_MOTION_VECTORS, p);
        self
    }

    pub fn raw(mut self, kind: u32, payload: &[u8]) -> Self {
        self.list.push(kind, payload.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.list.build()
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Builds a frame container (`frame_data_count` + containers).
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder {
    list: ContainerList,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bone_matrices(mut self, matrices: &[Mat4]) -> Self {
        let mut p = Vec::with_capacity(4 + matrices.len() * 64);
        put_u32(&mut p, matrices.len() as u32);
        for m in matrices {
            put_f32s(&mut p, &m.to_cols_array());
        }
        self.list.push(FRAME_ANIM_MAT4X4_32, p);
        self
    }

    pub fn pose(mut self, skeleton_index: u32, bounds: Aabb, pose: &[(Vec3, Quat)]) -> Self {
        let mut p = Vec::new();
        put_u32(&mut p, skeleton_index);
        put_u32(&mut p, pose.len() as u32);
        encode_pose(&mut p, bounds, pose);
        self.list.push(FRAME_ANIM_POS_ROTATION_128, p);
        self
    }

    pub fn delta_positions(mut self, bounds: Aabb, deltas: &[u32]) -> Self {
        let mut p = Vec::new();
        put_f32s(&mut p, &bounds.to_floats());
        put_u32(&mut p, deltas.len() as u32);
        for &d in deltas {
            put_u32(&mut p, d);
        }
        self.list.push(FRAME_ANIM_DELTA_POS_32, p);
        self
    }

    pub fn colors565(mut self, colors: &[u16]) -> Self {
        let mut p = Vec::with_capacity(4 + colors.len() * 2);
        put_u32(&mut p, colors.len() as u32);
        for c in colors {
            p.extend_from_slice(&c.to_le_bytes());
        }
        self.list.push(FRAME_COLORS_RGB_565, p);
        self
    }

    /// Colors with octahedral normals, `(rgb565, oct16)` per vertex.
    pub fn colors565_normals(mut self, values: &[(u16, u16)]) -> Self {
        let mut p = Vec::with_capacity(4 + values.len() * 4);
        put_u32(&mut p, values.len() as u32);
        for (c, n) in values {
            p.extend_from_slice(&c.to_le_bytes());
            p.extend_from_slice(&n.to_le_bytes());
        }
        self.list.push(FRAME_COLORS_RGB_565_NORMALS_OCT_16, p);
        self
    }

    /// Inline luma texture, as produced by [`TextureBuilder`].
    ///
    /// The importer moves it into the frame's texture container.
    pub fn texture(mut self, tagged: &[u8]) -> Self {
        if tagged.len() >= TAG_SIZE {
            let kind = u32::from_le_bytes([tagged[0], tagged[1], tagged[2], tagged[3]]);
            self.list.push(kind, tagged[TAG_SIZE..].to_vec());
        }
        self
    }

    pub fn raw(mut self, kind: u32, payload: &[u8]) -> Self {
        self.list.push(kind, payload.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.list.build()
    }
}

/// Tagged luma texture containers.
pub struct TextureBuilder;

impl TextureBuilder {
    pub fn luma8(pixels: &[u8]) -> Vec<u8> {
        let mut p = Vec::with_capacity(4 + pixels.len());
        put_u32(&mut p, pixels.len() as u32);
        p.extend_from_slice(pixels);
        let mut out = Vec::new();
        push_container(&mut out, FRAME_TEXTURE_LUMA_8, &p);
        out
    }

    pub fn luma_bc4(blocks: &[[u8; 8]]) -> Vec<u8> {
        let mut p = Vec::with_capacity(4 + blocks.len() * 8);
        put_u32(&mut p, blocks.len() as u32);
        for b in blocks {
            p.extend_from_slice(b);
        }
        let mut out = Vec::new();
        push_container(&mut out, FRAME_TEXTURE_LUMA_BC4, &p);
        out
    }
}

// ============================================================================
// File
// ============================================================================

/// Assembles a complete AVV stream.
///
/// The segment table is generated from the added segments; vertex and index
/// counts are read back from each segment's containers.
#[derive(Debug, Clone)]
pub struct AvvWriter {
    magic: [u8; 4],
    version: u32,
    limits: Option<Limits>,
    extra_meta: MetaBuilder,
    segments: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
}

impl Default for AvvWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AvvWriter {
    pub fn new() -> Self {
        Self {
            magic: *AVV_MAGIC,
            version: AVV_VERSION,
            limits: None,
            extra_meta: MetaBuilder::new(),
            segments: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Additional meta containers (skeleton, unknown types) after the table.
    pub fn with_meta(mut self, meta: MetaBuilder) -> Self {
        self.extra_meta = meta;
        self
    }

    /// Add a segment container and its frame containers.
    pub fn add_segment(&mut self, segment: Vec<u8>, frames: Vec<Vec<u8>>) -> &mut Self {
        self.segments.push((segment, frames));
        self
    }

    fn segment_blob(segment: &[u8], frames: &[Vec<u8>]) -> Vec<u8> {
        let frames_len: usize = frames.iter().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(segment.len() + 4 + frames_len);
        payload.extend_from_slice(segment);
        put_u32(&mut payload, frames.len() as u32);
        for f in frames {
            payload.extend_from_slice(f);
        }
        let mut out = Vec::with_capacity(payload.len() + TAG_SIZE);
        push_container(&mut out, SEGMENT_FRAMES, &payload);
        out
    }

    fn meta(&self, table: &[SegmentTableEntry]) -> Vec<u8> {
        let mut meta = MetaBuilder::new().segment_table(table);
        if let Some(limits) = &self.limits {
            meta = meta.limits(limits);
        }
        meta.list.entries.extend(self.extra_meta.list.entries.iter().cloned());
        meta.build()
    }

    /// Serialise the whole stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let blobs: Vec<Vec<u8>> = self
            .segments
            .iter()
            .map(|(s, f)| Self::segment_blob(s, f))
            .collect();

        let mut table: Vec<SegmentTableEntry> = self
            .segments
            .iter()
            .map(|(segment, frames)| {
                let layout = SegmentLayout::parse(segment, &Limits::default()).unwrap_or_default();
                SegmentTableEntry {
                    frame_count: frames.len() as u32,
                    vertex_count: layout.vertex_count,
                    index_count: layout.indices.map_or(0, |i| i.count),
                    ..Default::default()
                }
            })
            .collect();

        // Meta size depends only on the entry count, so offsets can be laid out first
        let meta_len = self.meta(&table).len();
        let mut offset = (FILE_HEADER_SIZE + meta_len + 4) as u32;
        for (entry, blob) in table.iter_mut().zip(&blobs) {
            entry.byte_start = offset;
            entry.byte_length = blob.len() as u32;
            offset += blob.len() as u32;
        }

        let meta = self.meta(&table);
        let mut out = Vec::with_capacity(offset as usize);
        out.extend_from_slice(&self.magic);
        put_u32(&mut out, self.version);
        out.extend_from_slice(&meta);
        put_u32(&mut out, blobs.len() as u32);
        for blob in &blobs {
            out.extend_from_slice(blob);
        }
        out
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&self.to_bytes())?;
        w.flush()?;
        Ok(())
    }
}
