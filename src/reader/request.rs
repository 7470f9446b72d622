//! Reader requests and their I/O operations.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::format::{Frame, Segment};
use crate::pool::BlockRef;
use crate::storage::IoHandle;
use crate::util::Error;

/// Which container an I/O operation fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Segment,
    Frame,
    Texture,
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartKind::Segment => "segment",
            PartKind::Frame => "frame",
            PartKind::Texture => "texture",
        })
    }
}

/// A part that was read but could not be parsed.
#[derive(Debug)]
pub struct PartFailure {
    pub part: PartKind,
    pub error: Error,
}

/// One asynchronous read belonging to a request.
#[derive(Debug)]
pub(crate) struct IoOp {
    pub kind: PartKind,
    /// Segment or frame index the container belongs to.
    pub index: u32,
    pub handle: IoHandle,
    pub processed: bool,
}

/// A unit of streaming work: an optional segment plus an optional frame
/// (and its texture).
///
/// Requests move pending -> waiting on I/O -> finished. Parse failures of
/// individual parts are recorded in [`Request::failures`]; the parts that
/// parsed are still delivered.
pub struct Request {
    pub segment_index: Option<u32>,
    pub frame_index: Option<u32>,
    pub want_texture: bool,
    /// Read synchronously by `add_request`; never held an active-frame marker.
    pub blocking: bool,
    pub segment: Option<Segment>,
    pub frame: Option<Frame>,
    pub failures: Vec<PartFailure>,
    pub(crate) ops: SmallVec<[IoOp; 3]>,
    completed: AtomicUsize,
    /// Texture container that completed before its frame was parsed.
    pub(crate) pending_texture: Option<(BlockRef, usize)>,
}

impl Request {
    pub(crate) fn new(segment_index: Option<u32>, frame_index: Option<u32>, want_texture: bool) -> Self {
        Self {
            segment_index,
            frame_index,
            want_texture,
            blocking: false,
            segment: None,
            frame: None,
            failures: Vec::new(),
            ops: SmallVec::new(),
            completed: AtomicUsize::new(0),
            pending_texture: None,
        }
    }

    /// Number of I/O operations issued for this request.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Operations that have completed and been parsed.
    pub fn completed_ops(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn all_processed(&self) -> bool {
        self.completed_ops() == self.ops.len()
    }

    pub(crate) fn fail(&mut self, part: PartKind, error: Error) {
        tracing::warn!(
            segment = ?self.segment_index,
            frame = ?self.frame_index,
            %part,
            %error,
            "discarding unparsable part"
        );
        self.failures.push(PartFailure { part, error });
    }

    /// Whether every requested part arrived and parsed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
            && self.segment_index.is_none() == self.segment.is_none()
            && self.frame_index.is_none() == self.frame.is_none()
    }

    /// Take the parsed segment and frame out of the request.
    pub fn into_parts(self) -> (Option<Segment>, Option<Frame>) {
        (self.segment, self.frame)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("segment_index", &self.segment_index)
            .field("frame_index", &self.frame_index)
            .field("want_texture", &self.want_texture)
            .field("blocking", &self.blocking)
            .field("has_segment", &self.segment.is_some())
            .field("has_frame", &self.frame.is_some())
            .field("ops", &self.ops.len())
            .field("completed", &self.completed_ops())
            .field("failures", &self.failures.len())
            .finish()
    }
}
