//! Streamable package: an imported AVV stream split into addressable containers.
//!
//! The raw AVV layout interleaves each segment with its frames, which makes
//! fetching a single frame awkward. Import rewrites the stream into one blob
//! where the meta section, every segment, every frame and every frame
//! texture is a separate contiguous span, and records the largest of each
//! kind so the reader can size pool blocks once.
//!
//! Package file layout (all little-endian):
//!
//! ```text
//! magic "AVVP" | package version u32 | avv version u32
//! max segment u32 | max frame u32 | max texture u32
//! segment count u32 | frame count u32
//! meta span (offset u64, len u32)
//! segment spans | frame spans | texture spans (len 0 = none)
//! container blob
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::read_util::ByteReader;
use crate::storage::{check_range, Storage};
use crate::util::{Error, Result};

pub const PACKAGE_MAGIC: &[u8; 4] = b"AVVP";
pub const PACKAGE_VERSION: u32 = 1;

/// Size of the fixed part of the package header.
pub const PACKAGE_FIXED_HEADER: usize = 4 * 8 + 12;

const SPAN_SIZE: usize = 12;

/// Location of one container inside the package storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerSpan {
    pub offset: u64,
    pub len: u32,
}

impl ContainerSpan {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn shifted(self, base: u64) -> Self {
        Self {
            offset: self.offset + base,
            len: self.len,
        }
    }
}

/// Names a streamable container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerId {
    Meta,
    Segment(u32),
    Frame(u32),
    FrameTexture(u32),
}

/// Container table of a package.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageLayout {
    pub version: u32,
    pub meta: ContainerSpan,
    pub segments: Vec<ContainerSpan>,
    pub frames: Vec<ContainerSpan>,
    /// One entry per frame; `None` when the frame carries no texture.
    pub textures: Vec<Option<ContainerSpan>>,
    pub max_segment_bytes: u32,
    pub max_frame_bytes: u32,
    pub max_texture_bytes: u32,
}

impl PackageLayout {
    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Resolve a container name to its span.
    pub fn span(&self, id: ContainerId) -> Option<ContainerSpan> {
        match id {
            ContainerId::Meta => Some(self.meta),
            ContainerId::Segment(i) => self.segments.get(i as usize).copied(),
            ContainerId::Frame(i) => self.frames.get(i as usize).copied(),
            ContainerId::FrameTexture(i) => self.textures.get(i as usize).copied().flatten(),
        }
    }

    pub fn has_texture(&self, frame: u32) -> bool {
        self.span(ContainerId::FrameTexture(frame)).is_some()
    }

    /// Header length for this layout once encoded.
    pub fn encoded_len(&self) -> usize {
        PACKAGE_FIXED_HEADER + (self.segments.len() + self.frames.len() * 2) * SPAN_SIZE
    }

    /// Encode the header with every span shifted by `base`.
    pub fn encode(&self, base: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        out[0..4].copy_from_slice(PACKAGE_MAGIC);
        let words = [
            PACKAGE_VERSION,
            self.version,
            self.max_segment_bytes,
            self.max_frame_bytes,
            self.max_texture_bytes,
            self.segment_count(),
            self.frame_count(),
        ];
        LittleEndian::write_u32_into(&words, &mut out[4..32]);

        let mut pos = 32;
        let mut put = |span: ContainerSpan| {
            LittleEndian::write_u64(&mut out[pos..pos + 8], span.offset);
            LittleEndian::write_u32(&mut out[pos + 8..pos + 12], span.len);
            pos += SPAN_SIZE;
        };
        put(self.meta.shifted(base));
        for s in &self.segments {
            put(s.shifted(base));
        }
        for f in &self.frames {
            put(f.shifted(base));
        }
        for t in &self.textures {
            put(t.map_or(ContainerSpan::default(), |t| t.shifted(base)));
        }
        out
    }

    /// Read the counts from the fixed header part, returning the full header length.
    pub fn header_len(fixed: &[u8]) -> Result<usize> {
        let mut r = ByteReader::new(fixed);
        let magic = r.bytes(4)?;
        if magic != PACKAGE_MAGIC {
            let mut m = [0u8; 4];
            m.copy_from_slice(magic);
            return Err(Error::InvalidMagic(m));
        }
        let package_version = r.u32()?;
        if package_version != PACKAGE_VERSION {
            return Err(Error::invalid(format!(
                "unsupported package version {package_version}"
            )));
        }
        r.skip(16)?;
        let segments = u64::from(r.u32()?);
        let frames = u64::from(r.u32()?);
        let total = (segments + frames * 2) * SPAN_SIZE as u64 + PACKAGE_FIXED_HEADER as u64;
        usize::try_from(total)
            .map_err(|_| Error::invalid(format!("package header of {total} bytes is not addressable")))
    }

    /// Decode a full package header.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let total = Self::header_len(data)?;
        if data.len() < total {
            return Err(Error::eof(0, total, data.len()));
        }
        let mut r = ByteReader::new(&data[8..total]);
        let version = r.u32()?;
        let max_segment_bytes = r.u32()?;
        let max_frame_bytes = r.u32()?;
        let max_texture_bytes = r.u32()?;
        let segment_count = r.u32()?;
        let frame_count = r.u32()?;

        let mut span = || -> Result<ContainerSpan> {
            Ok(ContainerSpan {
                offset: r.u64()?,
                len: r.u32()?,
            })
        };
        let meta = span()?;
        let segments = (0..segment_count).map(|_| span()).collect::<Result<_>>()?;
        let frames = (0..frame_count).map(|_| span()).collect::<Result<_>>()?;
        let textures = (0..frame_count)
            .map(|_| span().map(|s| (!s.is_empty()).then_some(s)))
            .collect::<Result<_>>()?;

        Ok(Self {
            version,
            meta,
            segments,
            frames,
            textures,
            max_segment_bytes,
            max_frame_bytes,
            max_texture_bytes,
        })
    }
}

impl PackageLayout {
    /// Read and decode a package header from the start of `storage`.
    pub fn read_from(storage: &dyn Storage) -> Result<Self> {
        let mut fixed = [0u8; PACKAGE_FIXED_HEADER];
        storage.read_sync(0, &mut fixed)?;
        let total = PackageLayout::header_len(&fixed)?;
        if total as u64 > storage.len() {
            return Err(Error::eof(0, total, storage.len() as usize));
        }
        let mut header = vec![0u8; total];
        storage.read_sync(0, &mut header)?;
        let layout = PackageLayout::decode(&header)?;

        let spans = std::iter::once(layout.meta)
            .chain(layout.segments.iter().copied())
            .chain(layout.frames.iter().copied())
            .chain(layout.textures.iter().flatten().copied());
        for span in spans {
            check_range(span.offset, span.len as usize, storage.len())?;
        }
        Ok(layout)
    }
}

/// An imported stream: container table plus the blob it indexes.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub layout: PackageLayout,
    pub blob: Vec<u8>,
    /// Legacy skinned segments rewritten to the write-table form on import.
    pub patched_segments: u32,
}

impl Package {
    pub(crate) fn new(version: u32) -> Self {
        Self {
            layout: PackageLayout {
                version,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Append container bytes to the blob.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> ContainerSpan {
        let span = ContainerSpan {
            offset: self.blob.len() as u64,
            len: bytes.len() as u32,
        };
        self.blob.extend_from_slice(bytes);
        span
    }

    pub(crate) fn push_segment(&mut self, bytes: &[u8]) {
        let span = self.push(bytes);
        self.layout.max_segment_bytes = self.layout.max_segment_bytes.max(span.len);
        self.layout.segments.push(span);
    }

    pub(crate) fn push_frame(&mut self, bytes: &[u8], texture: Option<&[u8]>) {
        let span = self.push(bytes);
        self.layout.max_frame_bytes = self.layout.max_frame_bytes.max(span.len);
        self.layout.frames.push(span);

        let texture = texture.map(|t| self.push(t));
        if let Some(t) = texture {
            self.layout.max_texture_bytes = self.layout.max_texture_bytes.max(t.len);
        }
        self.layout.textures.push(texture);
    }

    /// Bytes of a container, straight from the blob.
    pub fn container(&self, id: ContainerId) -> Option<&[u8]> {
        let span = self.layout.span(id)?;
        let start = span.offset as usize;
        self.blob.get(start..start + span.len as usize)
    }

    /// Serialise as a package file (header followed by the blob).
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.layout.encode(self.layout.encoded_len() as u64);
        let mut out = Vec::with_capacity(header.len() + self.blob.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.blob);
        out
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&self.layout.encode(self.layout.encoded_len() as u64))?;
        w.write_all(&self.blob)?;
        w.flush()?;
        Ok(())
    }
}
