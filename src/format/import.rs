//! AVV importer: raw stream to streamable [`Package`].
//!
//! Splits the interleaved `SEGMENT_FRAMES` blobs into separately addressable
//! containers:
//!
//! - meta: from `meta_container_count` through the last meta container
//! - segment: `segment_data_count` + segment sub-containers
//! - frame: `frame_data_count` + every non-texture frame sub-container
//! - frame texture: the frame's luma sub-container, tag included
//!
//! Legacy skinned sub-containers (`POS_SKIN_EXPAND_128`) are rewritten to
//! the write-table form on the way through, so the runtime only ever sees
//! the v2 layout.

use byteorder::{ByteOrder, LittleEndian};

use super::compression::inflate_if_gzip;
use super::constants::*;
use super::expansion::ExpansionTable;
use super::package::Package;
use super::read_util::ByteReader;
use super::writer::push_container;
use crate::util::{Error, Result};

/// Import options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Reject streams whose first four bytes are not the AVV magic.
    pub verify_magic: bool,
    /// Rewrite legacy skinned sub-containers with a write table.
    pub patch_legacy_skinning: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            verify_magic: true,
            patch_legacy_skinning: true,
        }
    }
}

/// Import a raw (optionally gzip-wrapped) AVV stream.
#[tracing::instrument(skip_all, fields(bytes = data.len()))]
pub fn import_avv(data: &[u8], options: &ImportOptions) -> Result<Package> {
    let data = inflate_if_gzip(data)?;
    let mut r = ByteReader::new(&data);

    let magic = r.bytes(4)?;
    if options.verify_magic && magic != AVV_MAGIC {
        let mut m = [0u8; 4];
        m.copy_from_slice(magic);
        return Err(Error::InvalidMagic(m));
    }

    let version = r.u32()?;
    if version != AVV_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let mut pkg = Package::new(version);

    let meta_start = r.position();
    let meta_count = r.u32()?;
    for _ in 0..meta_count {
        r.container()?;
    }
    pkg.layout.meta = pkg.push(&data[meta_start..r.position()]);

    let blob_count = r.u32()?;
    for i in 0..blob_count {
        let (tag, blob) = r.container()?;
        if tag.kind != SEGMENT_FRAMES {
            tracing::warn!(index = i, kind = tag.kind, "skipping non-segment top-level container");
            continue;
        }
        import_segment_frames(&mut pkg, blob, options)?;
    }

    if !r.is_empty() {
        tracing::debug!(trailing = r.remaining(), "ignoring bytes after the last segment");
    }

    tracing::info!(
        segments = pkg.layout.segment_count(),
        frames = pkg.layout.frame_count(),
        patched = pkg.patched_segments,
        "imported AVV {}",
        version_string(version)
    );
    Ok(pkg)
}

fn import_segment_frames(
    pkg: &mut Package,
    mut r: ByteReader<'_>,
    options: &ImportOptions,
) -> Result<()> {
    let sub_count = r.u32()?;
    let mut segment = Vec::with_capacity(r.remaining());
    segment.extend_from_slice(&sub_count.to_le_bytes());
    let mut patched = false;

    for _ in 0..sub_count {
        let (tag, mut sub) = r.container()?;
        let payload = sub.bytes(sub.remaining())?;
        if tag.kind == SEGMENT_POS_SKIN_EXPAND_128 && options.patch_legacy_skinning {
            let upgraded = patch_legacy_skinning(payload)?;
            push_container(&mut segment, SEGMENT_POS_SKIN_EXPAND_128_V2, &upgraded);
            patched = true;
        } else {
            push_container(&mut segment, tag.kind, payload);
        }
    }
    if patched {
        pkg.patched_segments += 1;
    }
    pkg.push_segment(&segment);

    let frame_count = r.u32()?;
    for _ in 0..frame_count {
        let data_count = r.u32()?;
        let mut frame = vec![0u8; 4];
        let mut kept = 0u32;
        let mut texture: Option<Vec<u8>> = None;

        for _ in 0..data_count {
            let (tag, mut sub) = r.container()?;
            let payload = sub.bytes(sub.remaining())?;
            if is_frame_texture(tag.kind) {
                if texture.is_some() {
                    tracing::warn!(frame = pkg.layout.frame_count(), "frame has several textures, keeping the last");
                }
                let mut tagged = Vec::with_capacity(payload.len() + TAG_SIZE);
                push_container(&mut tagged, tag.kind, payload);
                texture = Some(tagged);
            } else {
                push_container(&mut frame, tag.kind, payload);
                kept += 1;
            }
        }

        LittleEndian::write_u32(&mut frame[0..4], kept);
        pkg.push_frame(&frame, texture.as_deref());
    }

    Ok(())
}

/// Rewrite a legacy skinned payload with a materialised write table.
///
/// Layout in: aabb, vertex count, compact count, list count, list, vertices.
/// Layout out: aabb, vertex count, compact count, write table, vertices.
pub fn patch_legacy_skinning(payload: &[u8]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(payload);
    let head = r.bytes(6 * 4 + 8)?;
    let compact = LittleEndian::read_u32(&head[28..32]) as usize;

    let list_count = r.u32()? as usize;
    let list = r.bytes(list_count)?;
    if list_count < compact {
        return Err(Error::invalid(format!(
            "expansion list has {list_count} entries for {compact} compact vertices"
        )));
    }
    let table = ExpansionTable::from_run_lengths(&list[..compact])?;
    let vertices = r.bytes(r.remaining())?;

    let mut out = Vec::with_capacity(payload.len() - list_count - 4 + compact * 4);
    out.extend_from_slice(head);
    out.extend_from_slice(&table.to_le_bytes());
    out.extend_from_slice(vertices);
    Ok(out)
}
