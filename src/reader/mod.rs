//! Streaming reader.
//!
//! Turns segment/frame requests into storage reads and parsed containers.
//! Requests flow through three queues:
//!
//! ```text
//! add_request -> pending -> (update) waiting on I/O -> finished -> get_finished_request
//! ```
//!
//! [`AvvReader::update`] runs one cycle and is safe to call from any thread;
//! a cycle already in progress makes concurrent calls return immediately.
//! Blocking requests bypass the queues and read synchronously.

mod request;

pub use request::{PartFailure, PartKind, Request};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::format::{ContainerId, Frame, Header, Limits, Segment, AVV_VERSION};
use crate::pool::{BlockRef, MemoryPool};
use crate::storage::{AvvAsset, IoStatus};
use crate::util::{Error, Result};
use request::IoOp;

/// Reader tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Requests allowed to wait on I/O at once.
    pub max_in_flight: usize,
    /// Blocks of the largest segment and frame size reserved on open.
    pub preallocated_containers: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            preallocated_containers: 4,
        }
    }
}

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    /// No container open.
    None = 0,
    Ready = 1,
    WaitingIo = 2,
    /// The last cycle dropped a request after an I/O error.
    Error = 3,
}

impl ReaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::WaitingIo,
            3 => Self::Error,
            _ => Self::None,
        }
    }
}

/// Summary of an opened container.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub header: Arc<Header>,
    pub segment_count: u32,
    pub frame_count: u32,
    pub max_segment_bytes: u32,
    pub max_frame_bytes: u32,
    pub max_texture_bytes: u32,
}

/// Accumulated read statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub bytes: u64,
    pub failed_reads: u64,
    /// Sum of issue-to-completion times of asynchronous reads.
    pub latency: Duration,
}

#[derive(Debug, Default)]
struct IoCounters {
    reads: AtomicU64,
    bytes: AtomicU64,
    failed: AtomicU64,
    latency_micros: AtomicU64,
}

impl IoCounters {
    fn record(&self, len: usize, latency: Option<Duration>) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.latency_micros
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            failed_reads: self.failed.load(Ordering::Relaxed),
            latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
        }
    }
}

/// An opened container and its lookup tables.
struct OpenAsset {
    asset: AvvAsset,
    header: Arc<Header>,
    /// Segment of each frame.
    frame_segments: Vec<u32>,
    /// First frame of each segment.
    segment_starts: Vec<u32>,
}

impl OpenAsset {
    fn build(asset: AvvAsset) -> Result<Self> {
        let layout = &asset.layout;
        if layout.version != AVV_VERSION {
            return Err(Error::UnsupportedVersion(layout.version));
        }

        let meta = asset.read_container(ContainerId::Meta)?;
        let header = Header::parse(layout.version, &meta)?;

        if header.segment_count() != layout.segment_count() {
            return Err(Error::invalid(format!(
                "segment table lists {} segments, package has {}",
                header.segment_count(),
                layout.segment_count()
            )));
        }
        if header.frame_count() != layout.frame_count() {
            return Err(Error::invalid(format!(
                "segment table lists {} frames, package has {}",
                header.frame_count(),
                layout.frame_count()
            )));
        }
        Limits::check("frame", header.frame_count(), header.limits.max_frame_count)?;

        let mut frame_segments = Vec::with_capacity(header.frame_count() as usize);
        let mut segment_starts = Vec::with_capacity(header.segment_table.len());
        for (s, entry) in header.segment_table.iter().enumerate() {
            segment_starts.push(frame_segments.len() as u32);
            frame_segments.extend(std::iter::repeat(s as u32).take(entry.frame_count as usize));
        }

        Ok(Self {
            asset,
            header: Arc::new(header),
            frame_segments,
            segment_starts,
        })
    }

    fn metadata(&self) -> Metadata {
        let layout = &self.asset.layout;
        Metadata {
            header: Arc::clone(&self.header),
            segment_count: layout.segment_count(),
            frame_count: layout.frame_count(),
            max_segment_bytes: layout.max_segment_bytes,
            max_frame_bytes: layout.max_frame_bytes,
            max_texture_bytes: layout.max_texture_bytes,
        }
    }

    /// Containers a request touches, with the block size to allocate for each.
    fn parts(&self, request: &Request) -> Vec<(PartKind, u32, ContainerId, usize)> {
        let layout = &self.asset.layout;
        let mut parts = Vec::with_capacity(3);
        if let Some(s) = request.segment_index {
            parts.push((PartKind::Segment, s, ContainerId::Segment(s), layout.max_segment_bytes as usize));
        }
        if let Some(f) = request.frame_index {
            parts.push((PartKind::Frame, f, ContainerId::Frame(f), layout.max_frame_bytes as usize));
            if request.want_texture && layout.has_texture(f) {
                parts.push((
                    PartKind::Texture,
                    f,
                    ContainerId::FrameTexture(f),
                    layout.max_texture_bytes as usize,
                ));
            }
        }
        parts
    }
}

/// Asynchronous segment/frame reader over one [`AvvAsset`].
pub struct AvvReader {
    pool: MemoryPool,
    config: ReaderConfig,
    opened: RwLock<Option<Arc<OpenAsset>>>,
    state: AtomicU8,
    /// Requests with reads in flight. Held for the whole update cycle.
    waiting: Mutex<VecDeque<Request>>,
    pending: Mutex<VecDeque<Request>>,
    finished: Mutex<VecDeque<Request>>,
    active_frames: Mutex<HashSet<u32>>,
    io: IoCounters,
    /// Runs asynchronous reads; the global rayon pool when unset.
    workers: Option<Arc<ThreadPool>>,
}

impl AvvReader {
    pub fn new(pool: MemoryPool, config: ReaderConfig) -> Self {
        Self {
            pool,
            config,
            opened: RwLock::new(None),
            state: AtomicU8::new(ReaderState::None as u8),
            waiting: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            finished: Mutex::new(VecDeque::new()),
            active_frames: Mutex::new(HashSet::new()),
            io: IoCounters::default(),
            workers: None,
        }
    }

    /// Issue asynchronous reads on `workers` instead of the global pool.
    pub fn with_thread_pool(mut self, workers: Arc<ThreadPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn config(&self) -> ReaderConfig {
        self.config
    }

    pub fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn open_asset(&self) -> Option<Arc<OpenAsset>> {
        self.opened.read().clone()
    }

    /// Open a container, replacing any previously open one.
    ///
    /// On failure the reader stays closed.
    #[tracing::instrument(skip_all, fields(
        segments = asset.layout.segment_count(),
        frames = asset.layout.frame_count(),
    ))]
    pub fn open(&self, asset: AvvAsset) -> Result<Metadata> {
        self.close();

        let open = OpenAsset::build(asset)?;
        let metadata = open.metadata();

        let n = self.config.preallocated_containers;
        if metadata.max_segment_bytes > 0 {
            self.pool.preallocate(metadata.max_segment_bytes as usize, n);
        }
        if metadata.max_frame_bytes > 0 {
            self.pool.preallocate(metadata.max_frame_bytes as usize, n);
        }

        info!(
            version = %open.header.version_string(),
            segments = metadata.segment_count,
            frames = metadata.frame_count,
            skeleton = open.header.skeleton.is_some(),
            "opened AVV container"
        );
        *self.opened.write() = Some(Arc::new(open));
        self.set_state(ReaderState::Ready);
        Ok(metadata)
    }

    /// Drop all queued work and the open container.
    pub fn close(&self) {
        let mut waiting = self.waiting.lock();
        waiting.clear();
        self.pending.lock().clear();
        self.finished.lock().clear();
        self.active_frames.lock().clear();
        *self.opened.write() = None;
        self.set_state(ReaderState::None);
    }

    pub fn is_open(&self) -> bool {
        self.opened.read().is_some()
    }

    pub fn header(&self) -> Option<Arc<Header>> {
        self.open_asset().map(|o| Arc::clone(&o.header))
    }

    pub fn frame_count(&self) -> u32 {
        self.open_asset().map_or(0, |o| o.frame_segments.len() as u32)
    }

    pub fn segment_count(&self) -> u32 {
        self.open_asset().map_or(0, |o| o.segment_starts.len() as u32)
    }

    /// Segment containing `frame`.
    pub fn segment_index(&self, frame: u32) -> Option<u32> {
        self.open_asset()?.frame_segments.get(frame as usize).copied()
    }

    /// First frame of `segment`.
    pub fn segment_start_frame(&self, segment: u32) -> Option<u32> {
        self.open_asset()?.segment_starts.get(segment as usize).copied()
    }

    pub fn has_active_frame(&self, frame: u32) -> bool {
        self.active_frames.lock().contains(&frame)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    pub fn io_stats(&self) -> IoStats {
        self.io.snapshot()
    }

    /// Queue (or, with `blocking`, immediately perform) a request.
    ///
    /// Returns `false` when the reader is closed, the request is empty or out
    /// of range, the frame already has a request in flight, or a blocking
    /// read fails.
    pub fn add_request(
        &self,
        segment: Option<u32>,
        frame: Option<u32>,
        want_texture: bool,
        blocking: bool,
    ) -> bool {
        let Some(open) = self.open_asset() else {
            return false;
        };
        if segment.is_none() && frame.is_none() {
            return false;
        }
        if let Err(e) = Self::check_indices(&open, segment, frame) {
            debug!(error = %e, "rejected request");
            return false;
        }

        let mut request = Request::new(segment, frame, want_texture);
        let mut active = self.active_frames.lock();
        if let Some(f) = frame {
            if active.contains(&f) {
                return false;
            }
        }

        if blocking {
            drop(active);
            request.blocking = true;
            return match self.read_blocking(&open, request) {
                Ok(request) => {
                    self.finished.lock().push_back(request);
                    true
                }
                Err(e) => {
                    self.io.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(?segment, ?frame, error = %e, "blocking request failed");
                    false
                }
            };
        }

        if let Some(f) = frame {
            active.insert(f);
        }
        self.pending.lock().push_back(request);
        true
    }

    fn check_indices(open: &OpenAsset, segment: Option<u32>, frame: Option<u32>) -> Result<()> {
        let segments = open.segment_starts.len() as u32;
        let frames = open.frame_segments.len() as u32;
        if let Some(index) = segment.filter(|&s| s >= segments) {
            return Err(Error::IndexOutOfRange { what: "segment", index, count: segments });
        }
        if let Some(index) = frame.filter(|&f| f >= frames) {
            return Err(Error::IndexOutOfRange { what: "frame", index, count: frames });
        }
        Ok(())
    }

    /// Oldest finished request, if any.
    ///
    /// Releases the frame's active marker unless the request was blocking;
    /// an asynchronous request for the same frame may still be in flight.
    pub fn get_finished_request(&self) -> Option<Request> {
        let request = self.finished.lock().pop_front()?;
        if let Some(f) = request.frame_index.filter(|_| !request.blocking) {
            self.active_frames.lock().remove(&f);
        }
        Some(request)
    }

    /// Run one reader cycle.
    ///
    /// Returns `false` without doing anything if another cycle holds the lock.
    pub fn update(&self) -> bool {
        let Some(mut waiting) = self.waiting.try_lock() else {
            return false;
        };
        let Some(open) = self.open_asset() else {
            return true;
        };

        let mut failed = false;
        if !waiting.is_empty() {
            failed = self.process_waiting(&open, &mut waiting);
        }
        if !failed && waiting.len() < self.config.max_in_flight.max(1) {
            self.issue_next(&open, &mut waiting);
        }

        self.set_state(if failed {
            ReaderState::Error
        } else if waiting.is_empty() {
            ReaderState::Ready
        } else {
            ReaderState::WaitingIo
        });
        true
    }

    /// Poll the oldest waiting request. Returns `true` if it was dropped on error.
    fn process_waiting(&self, open: &OpenAsset, waiting: &mut VecDeque<Request>) -> bool {
        let limits = &open.header.limits;
        let Some(request) = waiting.front_mut() else {
            return false;
        };

        let mut io_error = None;
        for i in 0..request.ops.len() {
            let op = &mut request.ops[i];
            if op.processed {
                continue;
            }
            match op.handle.poll() {
                IoStatus::Waiting => {}
                IoStatus::Error => {
                    io_error = Some((op.kind, op.handle.error().unwrap_or_default()));
                    break;
                }
                IoStatus::Completed => {
                    op.processed = true;
                    let (kind, index, len) = (op.kind, op.index, op.handle.len());
                    self.io.record(len, op.handle.latency());
                    let block = op.handle.take_block();
                    request.mark_completed();
                    match block {
                        Some(block) => prepare_part(request, kind, index, block, len, limits),
                        None => request.fail(kind, Error::other("completed read returned no block")),
                    }
                }
            }
        }

        if let Some((part, reason)) = io_error {
            if let Some(request) = waiting.pop_front() {
                if let Some(f) = request.frame_index {
                    self.active_frames.lock().remove(&f);
                }
                self.io.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    segment = ?request.segment_index,
                    frame = ?request.frame_index,
                    %part,
                    %reason,
                    "read failed, dropping request"
                );
            }
            return true;
        }

        if waiting.front().is_some_and(Request::all_processed) {
            if let Some(mut request) = waiting.pop_front() {
                request.pending_texture = None;
                debug!(
                    segment = ?request.segment_index,
                    frame = ?request.frame_index,
                    failures = request.failures.len(),
                    "request finished"
                );
                self.finished.lock().push_back(request);
            }
        }
        false
    }

    /// Start the reads of the next pending request.
    fn issue_next(&self, open: &OpenAsset, waiting: &mut VecDeque<Request>) {
        let Some(mut request) = self.pending.lock().pop_front() else {
            return;
        };

        for (kind, index, id, block_size) in open.parts(&request) {
            let Some(span) = open.asset.span(id) else {
                continue;
            };
            let block = self.pool.allocate(block_size.max(span.len as usize));
            let handle = Arc::clone(&open.asset.storage).read_async(
                span.offset,
                span.len as usize,
                block,
                self.workers.as_deref(),
            );
            request.ops.push(IoOp {
                kind,
                index,
                handle,
                processed: false,
            });
        }

        debug!(
            segment = ?request.segment_index,
            frame = ?request.frame_index,
            ops = request.ops.len(),
            "issued request"
        );
        waiting.push_back(request);
    }

    /// Synchronous read and parse of every part.
    #[tracing::instrument(skip_all, fields(segment = ?request.segment_index, frame = ?request.frame_index))]
    fn read_blocking(&self, open: &OpenAsset, mut request: Request) -> Result<Request> {
        let limits = &open.header.limits;
        for (kind, index, id, block_size) in open.parts(&request) {
            let span = open
                .asset
                .span(id)
                .ok_or(Error::MissingData { what: "container", index })?;
            let len = span.len as usize;
            let mut block = self.pool.allocate(block_size.max(len));
            {
                let buf = block
                    .get_mut()
                    .ok_or_else(|| Error::other("fresh pool block is shared"))?;
                open.asset.storage.read_sync(span.offset, &mut buf[..len])?;
            }
            self.io.record(len, None);
            prepare_part(&mut request, kind, index, block, len, limits);
        }
        Ok(request)
    }
}

impl Drop for AvvReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for AvvReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvvReader")
            .field("state", &self.state())
            .field("segments", &self.segment_count())
            .field("frames", &self.frame_count())
            .field("pending", &self.pending_count())
            .field("finished", &self.finished_count())
            .finish()
    }
}

/// Parse a completed container into its slot on `request`.
///
/// A texture that completes before its frame is held until the frame parses.
fn prepare_part(request: &mut Request, kind: PartKind, index: u32, block: BlockRef, len: usize, limits: &Limits) {
    match kind {
        PartKind::Segment => match Segment::parse(index, block, len, limits) {
            Ok(segment) => request.segment = Some(segment),
            Err(e) => request.fail(kind, e),
        },
        PartKind::Frame => match Frame::parse(index, block, len, limits) {
            Ok(mut frame) => {
                if let Some((texture, texture_len)) = request.pending_texture.take() {
                    if let Err(e) = frame.attach_texture(texture, texture_len, limits) {
                        request.fail(PartKind::Texture, e);
                    }
                }
                request.frame = Some(frame);
            }
            Err(e) => {
                request.pending_texture = None;
                request.fail(kind, e);
            }
        },
        PartKind::Texture => {
            if let Some(frame) = request.frame.as_mut() {
                if let Err(e) = frame.attach_texture(block, len, limits) {
                    request.fail(kind, e);
                }
            } else if request
                .ops
                .iter()
                .any(|op| op.kind == PartKind::Frame && !op.processed)
            {
                request.pending_texture = Some((block, len));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::fixtures;
    use crate::storage::{IoCompleter, IoHandle, MemoryStorage, Storage};

    fn reader() -> AvvReader {
        AvvReader::new(MemoryPool::new(), ReaderConfig::default())
    }

    fn open_reader(frames: &[u32]) -> AvvReader {
        let reader = reader();
        reader
            .open(AvvAsset::from_package(fixtures::package(frames)))
            .unwrap();
        reader
    }

    fn drain(reader: &AvvReader) -> Vec<Request> {
        let mut out = Vec::new();
        for _ in 0..10_000 {
            reader.update();
            while let Some(r) = reader.get_finished_request() {
                out.push(r);
            }
            if reader.pending_count() == 0 && reader.state() == ReaderState::Ready {
                break;
            }
            std::thread::yield_now();
        }
        out
    }

    #[test]
    fn test_open_builds_tables() {
        let reader = reader();
        let meta = reader
            .open(AvvAsset::from_package(fixtures::package(&[4, 3, 3])))
            .unwrap();
        assert_eq!(meta.segment_count, 3);
        assert_eq!(meta.frame_count, 10);
        assert_eq!(reader.state(), ReaderState::Ready);
        assert_eq!(reader.segment_index(0), Some(0));
        assert_eq!(reader.segment_index(4), Some(1));
        assert_eq!(reader.segment_index(9), Some(2));
        assert_eq!(reader.segment_index(10), None);
        assert_eq!(reader.segment_start_frame(2), Some(7));
        // Segment and frame blocks reserved up front
        assert!(reader.pool().stats().free_bytes > 0);
    }

    #[test]
    fn test_open_rejects_version() {
        let reader = open_reader(&[1]);
        let mut pkg = fixtures::package(&[2]);
        pkg.layout.version = (1 << 16) | 6;
        assert!(matches!(
            reader.open(AvvAsset::from_package(pkg)),
            Err(Error::UnsupportedVersion(_))
        ));
        assert_eq!(reader.state(), ReaderState::None);
        assert!(reader.header().is_none());
        assert!(!reader.add_request(Some(0), Some(0), false, false));
    }

    #[test]
    fn test_open_rejects_inconsistent_layout() {
        let mut pkg = fixtures::package(&[2, 2]);
        pkg.layout.frames.pop();
        pkg.layout.textures.pop();
        assert!(reader().open(AvvAsset::from_package(pkg)).is_err());
    }

    #[test]
    fn test_request_lifecycle() {
        let reader = open_reader(&[2, 2]);
        assert!(reader.add_request(Some(1), Some(2), true, false));
        assert!(reader.has_active_frame(2));
        // Same frame while in flight is rejected
        assert!(!reader.add_request(None, Some(2), false, false));

        let finished = drain(&reader);
        assert_eq!(finished.len(), 1);
        let request = &finished[0];
        assert!(request.is_complete());
        assert_eq!(request.op_count(), 3);
        assert_eq!(request.completed_ops(), 3);
        let frame = request.frame.as_ref().unwrap();
        assert_eq!(frame.frame_index, 2);
        assert!(frame.has_texture());
        assert_eq!(frame.luma_bytes(), Some(&[2u8; 4][..]));
        assert_eq!(request.segment.as_ref().unwrap().layout.vertex_count, 4);
        assert!(!reader.has_active_frame(2));

        let stats = reader.io_stats();
        assert_eq!(stats.reads, 3);
        assert!(stats.bytes > 0);
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let reader = open_reader(&[2]);
        assert!(!reader.add_request(None, None, true, false));
        assert!(!reader.add_request(Some(1), None, false, false));
        assert!(!reader.add_request(None, Some(2), false, false));
        assert_eq!(reader.pending_count(), 0);
    }

    #[test]
    fn test_texture_skipped_when_absent() {
        let reader = open_reader(&[2]);
        assert!(reader.add_request(None, Some(1), true, false));
        let finished = drain(&reader);
        assert_eq!(finished[0].op_count(), 1);
        assert!(!finished[0].frame.as_ref().unwrap().has_texture());
    }

    #[test]
    fn test_blocking_request() {
        let reader = open_reader(&[3]);
        assert!(reader.add_request(Some(0), Some(0), true, true));
        assert!(!reader.has_active_frame(0));
        assert_eq!(reader.finished_count(), 1);
        let request = reader.get_finished_request().unwrap();
        assert!(request.is_complete());
        assert!(request.frame.unwrap().has_texture());
    }

    #[test]
    fn test_unparsable_frame_recorded() {
        let mut pkg = fixtures::package(&[3]);
        // Inflate the size of frame 1's first sub-container past its end
        let span = pkg.layout.frames[1];
        let at = span.offset as usize + 8;
        pkg.blob[at..at + 4].copy_from_slice(&0xFFFFu32.to_le_bytes());

        let reader = reader();
        reader.open(AvvAsset::from_package(pkg)).unwrap();
        assert!(reader.add_request(Some(0), Some(1), true, false));
        let finished = drain(&reader);
        assert_eq!(finished.len(), 1);

        let request = &finished[0];
        assert!(!request.is_complete());
        assert_eq!(request.failures.len(), 1);
        assert_eq!(request.failures[0].part, PartKind::Frame);
        assert_eq!(request.failures[0].error.kind(), crate::util::ErrorKind::Parse);
        assert!(request.frame.is_none());
        assert_eq!(request.segment.as_ref().unwrap().segment_index, 0);
        assert!(!reader.has_active_frame(1));

        // The reader keeps serving other frames
        assert!(reader.add_request(None, Some(2), true, false));
        let finished = drain(&reader);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].is_complete());
        assert_eq!(finished[0].frame.as_ref().unwrap().luma_bytes(), Some(&[2u8; 4][..]));
    }

    #[test]
    fn test_blocking_result_keeps_async_marker() {
        let reader = open_reader(&[3]);
        assert!(reader.add_request(None, Some(1), false, true));
        assert!(reader.add_request(None, Some(1), false, false));
        assert!(reader.has_active_frame(1));

        let blocking = reader.get_finished_request().unwrap();
        assert!(blocking.blocking);
        // The queued request still owns the frame
        assert!(reader.has_active_frame(1));
        assert!(!reader.add_request(None, Some(1), false, false));

        let finished = drain(&reader);
        assert_eq!(finished.len(), 1);
        assert!(!finished[0].blocking);
        assert!(!reader.has_active_frame(1));
    }

    #[test]
    fn test_fifo_order() {
        let reader = open_reader(&[5]);
        for f in 0..5 {
            assert!(reader.add_request(None, Some(f), false, false));
        }
        let order: Vec<_> = drain(&reader).iter().filter_map(|r| r.frame_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    /// Storage whose async reads complete only when the test says so.
    struct ManualStorage {
        inner: MemoryStorage,
        completers: Mutex<Vec<(IoCompleter, BlockRef, u64, usize)>>,
    }

    impl Storage for ManualStorage {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn read_sync(&self, offset: u64, out: &mut [u8]) -> Result<()> {
            self.inner.read_sync(offset, out)
        }

        fn read_async(
            self: Arc<Self>,
            offset: u64,
            len: usize,
            block: BlockRef,
            _workers: Option<&ThreadPool>,
        ) -> IoHandle {
            let (handle, completer) = IoHandle::pending(offset, len);
            self.completers.lock().push((completer, block, offset, len));
            handle
        }
    }

    impl ManualStorage {
        fn complete_all(&self) {
            for (completer, mut block, offset, len) in self.completers.lock().drain(..) {
                let buf = block.get_mut().unwrap();
                self.inner.read_sync(offset, &mut buf[..len]).unwrap();
                completer.complete(block);
            }
        }

        fn fail_all(&self) {
            for (completer, ..) in self.completers.lock().drain(..) {
                completer.fail("device lost");
            }
        }
    }

    fn manual_reader(frames: &[u32]) -> (AvvReader, Arc<ManualStorage>) {
        let pkg = fixtures::package(frames);
        let storage = Arc::new(ManualStorage {
            inner: MemoryStorage::new(pkg.blob),
            completers: Mutex::new(Vec::new()),
        });
        let reader = reader();
        reader
            .open(AvvAsset::new(pkg.layout, storage.clone()))
            .unwrap();
        (reader, storage)
    }

    #[test]
    fn test_waiting_io_cycle() {
        let (reader, storage) = manual_reader(&[2]);
        assert!(reader.add_request(Some(0), Some(0), false, false));
        assert!(reader.add_request(None, Some(1), false, false));

        reader.update();
        assert_eq!(reader.state(), ReaderState::WaitingIo);
        // One request in flight at a time
        assert_eq!(reader.pending_count(), 1);
        reader.update();
        assert_eq!(reader.state(), ReaderState::WaitingIo);
        assert!(reader.get_finished_request().is_none());

        storage.complete_all();
        reader.update();
        // First finished and the second issued in the same cycle
        assert_eq!(reader.state(), ReaderState::WaitingIo);
        assert_eq!(reader.finished_count(), 1);
        assert_eq!(reader.pending_count(), 0);

        storage.complete_all();
        reader.update();
        assert_eq!(reader.state(), ReaderState::Ready);
        assert_eq!(reader.finished_count(), 2);
    }

    #[test]
    fn test_io_error_drops_request() {
        let (reader, storage) = manual_reader(&[2]);
        assert!(reader.add_request(Some(0), Some(0), false, false));
        reader.update();
        storage.fail_all();
        reader.update();
        assert_eq!(reader.state(), ReaderState::Error);
        assert!(!reader.has_active_frame(0));
        assert!(reader.get_finished_request().is_none());
        assert_eq!(reader.io_stats().failed_reads, 1);

        reader.update();
        assert_eq!(reader.state(), ReaderState::Ready);
        // The frame can be requested again
        assert!(reader.add_request(None, Some(0), false, false));
    }

    #[test]
    fn test_update_skips_when_busy() {
        let reader = open_reader(&[1]);
        let _guard = reader.waiting.lock();
        assert!(!reader.update());
    }

    #[test]
    fn test_close_resets() {
        let reader = open_reader(&[2]);
        assert!(reader.add_request(None, Some(0), false, false));
        reader.close();
        assert_eq!(reader.state(), ReaderState::None);
        assert_eq!(reader.pending_count(), 0);
        assert!(!reader.has_active_frame(0));
        assert_eq!(reader.frame_count(), 0);
    }
}
