//! # AVV
//!
//! Streaming and decoding core for the AVV volumetric-video container.
//!
//! An AVV stream is a sequence of mesh segments, each followed by the
//! per-frame updates (animation, colors, luma texture) that play against it.
//! This crate parses the container, streams segments and frames from storage
//! through a block memory pool, caches a short window around the playback
//! cursor, and drives a decoder state machine that hands ready data to a
//! GPU-side collaborator.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math types, logging setup
//! - [`format`] - Container model, importer, writer and package files
//! - [`storage`] - Byte sources the reader streams from
//! - [`pool`] - Block memory pool
//! - [`reader`] - Asynchronous segment/frame reader
//! - [`cache`] - Direction-aware data cache
//! - [`decoder`] - Decoder state machine and CPU decode backend
//! - [`runtime`] - Shared runtime context and settings
//!
//! ## Example
//!
//! ```ignore
//! use avv::prelude::*;
//!
//! let runtime = PlayerRuntime::init(PlayerSettings::default())?;
//! let package = import_avv(&std::fs::read("clip.avv")?, &ImportOptions::default())?;
//! let mut decoder = runtime.create_decoder(Box::new(NullSink));
//! decoder.open(AvvAsset::from_package(package))?;
//!
//! decoder.set_frame(0, false);
//! loop {
//!     runtime.tick(&mut decoder);
//!     // ...render, then report back through decoder.signals()
//! }
//! ```

pub mod util;
pub mod format;
pub mod storage;
pub mod pool;
pub mod reader;
pub mod cache;
pub mod decoder;
pub mod runtime;

// Re-export commonly used types
pub use util::{Error, ErrorKind, Result};
pub use format::{import_avv, Frame, Header, Package, Segment};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{init_logging, Aabb, Error, ErrorKind, Result};
    pub use crate::format::{import_avv, Frame, Header, ImportOptions, Limits, Package, Segment};
    pub use crate::storage::{AvvAsset, FileStorage, MemoryStorage, Storage};
    pub use crate::pool::{BlockRef, MemoryPool};
    pub use crate::reader::{AvvReader, ReaderConfig, ReaderState, Request};
    pub use crate::cache::{CacheWindow, DataCache};
    pub use crate::decoder::{
        AvvDecoder, DecodeBackend, DecoderConfig, DecoderSignals, DecoderState, GpuDecodeSink, NullSink,
    };
    pub use crate::runtime::{PlayerRuntime, PlayerSettings};
}
