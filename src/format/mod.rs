//! AVV container format model.
//!
//! An AVV stream is a magic + version header, a meta section of tagged
//! containers, and a list of `SEGMENT_FRAMES` blobs. Every sub-container
//! starts with a `(type, size)` tag so unknown types can be skipped.
//!
//! - [`Header`] - meta section (segment table, limits, skeleton)
//! - [`Segment`] / [`Frame`] - parsed containers backed by pool blocks
//! - [`import_avv`] - raw stream to streamable [`Package`]
//! - [`AvvWriter`] and builders - stream assembly for tooling and tests

pub mod compression;
pub mod constants;
pub mod expansion;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod frame;
pub mod header;
pub mod import;
pub mod package;
pub mod read_util;
pub mod segment;
pub mod skeleton;
pub mod writer;

pub use compression::{gzip, inflate_if_gzip, is_gzip};
pub use constants::{AVV_MAGIC, AVV_VERSION};
pub use expansion::ExpansionTable;
pub use frame::{ColorData, DeltaPositions, Frame, FrameLayout, TextureLayout};
pub use header::{Header, Limits, SegmentTableEntry};
pub use import::{import_avv, patch_legacy_skinning, ImportOptions};
pub use package::{ContainerId, ContainerSpan, Package, PackageLayout};
pub use read_util::{ByteReader, ContainerTag, DataSpan};
pub use segment::{
    Expansion, IndexData, MotionVectors, Segment, SegmentLayout, TextureBlocks, UvData, UvFormat,
    VertexData, VertexEncoding,
};
pub use skeleton::{BoneInfo, Skeleton, SkeletonPose};
pub use writer::{AvvWriter, FrameBuilder, MetaBuilder, SegmentBuilder, SkinnedVertex, TextureBuilder};
