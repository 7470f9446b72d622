//! Decoder state machine.
//!
//! Drives playback of one opened container: requests the segment and frame
//! for the frame being shown (plus a short lookahead), moves finished reader
//! requests into the [`DataCache`], and submits ready data to a
//! [`GpuDecodeSink`].
//!
//! Each [`AvvDecoder::tick`] advances at most one stage:
//!
//! ```text
//! Idle -> WaitingCpu -> FinishedCpu -> WaitingGpu -> FinishedGpu -> Idle
//!              (data cached)  (submitted)  (signalled)   (swapped)
//! ```
//!
//! A missing container at submit time, or a culled update, passes through
//! `Error` for one tick before returning to `Idle`.

mod backend;
pub mod cpu;

pub use backend::{DecodeBackend, DecoderSignals, GpuDecodeSink, NullSink};
pub use cpu::{decode_frame_colors, decode_segment, DecodedColors, DecodedMesh, DecodedVertex};

use std::sync::Arc;

use rayon::ThreadPool;
use tracing::{debug, error, warn};

use crate::cache::{CacheWindow, DataCache};
use crate::format::{Frame, Segment};
use crate::pool::UploadGuard;
use crate::reader::{AvvReader, Metadata};
use crate::storage::AvvAsset;
use crate::util::{Error, Result};

/// Decoder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    Idle,
    /// Waiting for the reader to deliver the pending frame's data.
    WaitingCpu,
    /// Data for the pending frame is cached and ready to submit.
    FinishedCpu,
    /// Submitted; waiting for [`DecoderSignals`].
    WaitingGpu,
    FinishedGpu,
    Error,
}

/// Decoder options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub backend: DecodeBackend,
    /// Every `set_frame` reads and submits synchronously.
    pub immediate_mode: bool,
    pub request_textures: bool,
    /// Frames requested ahead of the pending one.
    pub lookahead_frames: u32,
    pub cache_window: CacheWindow,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            backend: DecodeBackend::Cpu,
            immediate_mode: false,
            request_textures: true,
            lookahead_frames: 2,
            cache_window: CacheWindow::default(),
        }
    }
}

/// Playback decoder for one [`AvvReader`].
pub struct AvvDecoder {
    reader: Arc<AvvReader>,
    cache: DataCache,
    config: DecoderConfig,
    sink: Box<dyn GpuDecodeSink>,
    signals: Arc<DecoderSignals>,
    thread_pool: Option<Arc<ThreadPool>>,
    state: DecoderState,
    requested_frame: Option<u32>,
    pending_frame: Option<u32>,
    current_frame: Option<u32>,
    decoded_segment: Option<u32>,
    /// Decoded segment before the in-flight submit, restored if it is culled.
    previous_segment: Option<u32>,
    requires_swap: bool,
    reverse: bool,
    uploads: Vec<UploadGuard>,
}

impl AvvDecoder {
    pub fn new(reader: Arc<AvvReader>, sink: Box<dyn GpuDecodeSink>, config: DecoderConfig) -> Self {
        Self {
            reader,
            cache: DataCache::new(config.cache_window),
            config,
            sink,
            signals: Arc::new(DecoderSignals::default()),
            thread_pool: None,
            state: DecoderState::Idle,
            requested_frame: None,
            pending_frame: None,
            current_frame: None,
            decoded_segment: None,
            previous_segment: None,
            requires_swap: false,
            reverse: false,
            uploads: Vec::new(),
        }
    }

    /// Run CPU decode on `pool` instead of the global rayon pool.
    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    /// Open `asset` on the reader and reset playback.
    pub fn open(&mut self, asset: AvvAsset) -> Result<Metadata> {
        self.reset();
        self.reader.open(asset)
    }

    /// Close the reader and drop all cached data.
    pub fn close(&mut self) {
        self.reset();
        self.reader.close();
    }

    fn reset(&mut self) {
        self.cache.empty();
        self.uploads.clear();
        self.signals.clear();
        self.state = DecoderState::Idle;
        self.requested_frame = None;
        self.pending_frame = None;
        self.current_frame = None;
        self.decoded_segment = None;
        self.previous_segment = None;
        self.requires_swap = false;
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn config(&self) -> DecoderConfig {
        self.config
    }

    /// Frame most recently submitted to the sink.
    pub fn current_frame(&self) -> Option<u32> {
        self.current_frame
    }

    pub fn pending_frame(&self) -> Option<u32> {
        self.pending_frame
    }

    pub fn requested_frame(&self) -> Option<u32> {
        self.requested_frame
    }

    pub fn decoded_segment(&self) -> Option<u32> {
        self.decoded_segment
    }

    /// Handle for the GPU side to report completion or culling.
    pub fn signals(&self) -> Arc<DecoderSignals> {
        Arc::clone(&self.signals)
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    pub fn reader(&self) -> &Arc<AvvReader> {
        &self.reader
    }

    pub fn sink(&self) -> &dyn GpuDecodeSink {
        self.sink.as_ref()
    }

    pub fn sink_mut(&mut self) -> &mut dyn GpuDecodeSink {
        self.sink.as_mut()
    }

    /// Evict relative to reverse playback when set.
    pub fn set_caching_direction(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    /// Request `frame` for display.
    ///
    /// `force` re-submits even if it is the current frame. In immediate mode
    /// the frame is read and submitted before returning.
    pub fn set_frame(&mut self, frame: u32, force: bool) {
        if frame >= self.reader.frame_count() {
            warn!(frame, frames = self.reader.frame_count(), "ignoring out-of-range frame");
            return;
        }
        if self.config.immediate_mode {
            if let Err(e) = self.set_frame_immediate(frame) {
                error!(frame, error = %e, "immediate frame update failed");
            }
            return;
        }
        if force {
            self.current_frame = None;
            self.requested_frame = Some(frame);
        } else if self.current_frame != Some(frame) {
            self.requested_frame = Some(frame);
        }
    }

    /// Read whatever `frame` needs synchronously and submit it.
    #[tracing::instrument(skip(self))]
    pub fn set_frame_immediate(&mut self, frame: u32) -> Result<()> {
        let segment = self.reader.segment_index(frame).ok_or(Error::IndexOutOfRange {
            what: "frame",
            index: frame,
            count: self.reader.frame_count(),
        })?;

        if !self.data_ready(segment, frame) {
            let textures = self.config.request_textures;
            if !self.segment_available(segment) {
                self.reader.add_request(Some(segment), Some(frame), textures, true);
            } else {
                self.reader.add_request(None, Some(frame), textures, true);
            }
            self.pending_frame = Some(frame);
            self.update_data_cache();
        }

        if !self.data_ready(segment, frame) {
            return Err(Error::MissingData { what: "frame", index: frame });
        }
        self.pending_frame = Some(frame);
        self.submit()
    }

    fn segment_available(&self, segment: u32) -> bool {
        self.decoded_segment == Some(segment) || self.cache.has_segment(segment)
    }

    fn data_ready(&self, segment: u32, frame: u32) -> bool {
        self.segment_available(segment) && self.cache.has_frame(frame)
    }

    /// Advance the state machine by one stage.
    pub fn tick(&mut self) {
        match self.state {
            DecoderState::Idle => {
                if self.config.immediate_mode {
                    return;
                }
                if let Some(requested) = self.requested_frame {
                    if Some(requested) != self.current_frame && Some(requested) != self.pending_frame {
                        self.pending_frame = Some(requested);
                        self.requested_frame = None;
                        self.decode_pending(true, true);
                    }
                }
            }
            DecoderState::WaitingCpu => {
                self.decode_pending(true, false);
            }
            DecoderState::FinishedCpu => {
                if let Err(e) = self.submit() {
                    error!(frame = ?self.pending_frame, error = %e, "submit failed");
                }
            }
            DecoderState::WaitingGpu => {
                if self.signals.take_culled() {
                    debug!(frame = ?self.current_frame, "update culled");
                    self.uploads.clear();
                    self.requires_swap = false;
                    self.decoded_segment = self.previous_segment;
                    self.current_frame = None;
                    self.state = DecoderState::Error;
                } else if self.signals.take_gpu_complete() {
                    self.state = DecoderState::FinishedGpu;
                }
            }
            DecoderState::FinishedGpu => {
                if self.requires_swap {
                    self.sink.on_swap_complete();
                    self.requires_swap = false;
                }
                self.uploads.clear();
                self.state = DecoderState::Idle;
            }
            DecoderState::Error => {
                error!(frame = ?self.current_frame, "error decoding segment, resetting");
                self.pending_frame = None;
                self.state = DecoderState::Idle;
            }
        }
    }

    /// Evict stale entries and move finished reader requests into the cache.
    pub fn update_data_cache(&mut self) {
        let segment = self.current_frame.and_then(|f| self.reader.segment_index(f));
        self.cache
            .free_stale_data(segment, self.current_frame, self.reverse);

        while let Some(request) = self.reader.get_finished_request() {
            let (segment, frame) = request.into_parts();
            if let Some(segment) = segment {
                self.cache.add_segment(segment);
            }
            if let Some(frame) = frame {
                self.cache.add_frame(frame);
            }
        }
    }

    /// Check whether the pending frame's data is cached, requesting it (and
    /// the lookahead) as needed. Returns `true` when it is ready.
    pub fn decode_pending(&mut self, request_missing: bool, request_lookahead: bool) -> bool {
        self.update_data_cache();

        let Some(frame) = self.pending_frame else {
            return false;
        };
        let Some(segment) = self.reader.segment_index(frame) else {
            warn!(frame, "pending frame outside the open container");
            self.state = DecoderState::Error;
            return false;
        };

        let segment_found = self.segment_available(segment);
        let frame_found = self.cache.has_frame(frame);
        let textures = self.config.request_textures;
        let mut requested_segment = false;

        if segment_found && frame_found {
            self.state = DecoderState::FinishedCpu;
        } else if request_missing {
            if !segment_found {
                self.reader.add_request(Some(segment), Some(frame), textures, false);
                requested_segment = true;
            } else {
                self.reader.add_request(None, Some(frame), textures, false);
            }
            self.state = DecoderState::WaitingCpu;
        }

        if request_lookahead {
            let frame_count = self.reader.frame_count();
            for n in 1..=self.config.lookahead_frames {
                let next = match frame.checked_add(n) {
                    Some(next) if next < frame_count => next,
                    _ => 0,
                };
                if self.cache.has_frame(next) {
                    continue;
                }
                let next_segment = self
                    .reader
                    .segment_index(next)
                    .filter(|&s| !(requested_segment && s == segment) && !self.segment_available(s));
                self.reader.add_request(next_segment, Some(next), textures, false);
            }
        }

        segment_found && frame_found
    }

    /// Hand the pending frame (and its segment, if new) to the sink.
    fn submit(&mut self) -> Result<()> {
        let Some(frame_index) = self.pending_frame else {
            self.state = DecoderState::Idle;
            return Ok(());
        };
        match self.collect(frame_index) {
            Ok((segment, frame)) => self.dispatch(segment, frame),
            Err(e) => {
                self.state = DecoderState::Error;
                Err(e)
            }
        }
    }

    fn collect(&self, frame_index: u32) -> Result<(Option<Arc<Segment>>, Arc<Frame>)> {
        let segment_index = self
            .reader
            .segment_index(frame_index)
            .ok_or(Error::MissingData { what: "segment", index: frame_index })?;

        if self.decoded_segment != Some(segment_index) {
            let (segment, frame) = self
                .cache
                .get_segment_and_frame(segment_index, frame_index)
                .ok_or(Error::MissingData { what: "segment", index: segment_index })?;
            Ok((Some(segment), frame))
        } else {
            let frame = self
                .cache
                .get_frame(frame_index)
                .ok_or(Error::MissingData { what: "frame", index: frame_index })?;
            Ok((None, frame))
        }
    }

    fn dispatch(&mut self, segment: Option<Arc<Segment>>, frame: Arc<Frame>) -> Result<()> {
        let (mesh, colors) = match self.config.backend {
            DecodeBackend::Cpu => {
                let decode = || -> Result<_> {
                    let mesh = segment.as_deref().map(decode_segment).transpose()?;
                    Ok((mesh, decode_frame_colors(&frame)))
                };
                let decoded = match &self.thread_pool {
                    Some(pool) => pool.install(decode),
                    None => decode(),
                };
                match decoded {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        self.state = DecoderState::Error;
                        return Err(e);
                    }
                }
            }
            DecodeBackend::GpuCompute => (None, None),
        };

        self.uploads.push(frame.begin_upload());
        self.uploads.extend(frame.begin_texture_upload());

        self.previous_segment = self.decoded_segment;
        if let Some(segment) = &segment {
            self.uploads.push(segment.begin_upload());
            self.sink.begin_segment_decode(segment, mesh.as_ref());
            self.decoded_segment = Some(segment.segment_index);
            self.requires_swap = true;
            segment.mark_processed();
        }
        self.sink.decode_frame(&frame, colors.as_ref());
        frame.mark_processed();

        debug!(
            frame = frame.frame_index,
            new_segment = segment.is_some(),
            backend = ?self.config.backend,
            "submitted frame"
        );
        self.current_frame = self.pending_frame.take();
        self.state = DecoderState::WaitingGpu;
        Ok(())
    }
}

impl std::fmt::Debug for AvvDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvvDecoder")
            .field("state", &self.state)
            .field("current_frame", &self.current_frame)
            .field("pending_frame", &self.pending_frame)
            .field("decoded_segment", &self.decoded_segment)
            .field("backend", &self.config.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::fixtures;
    use crate::pool::MemoryPool;
    use crate::reader::ReaderConfig;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Segment(u32, bool),
        Frame(u32, usize),
        Swap,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl GpuDecodeSink for RecordingSink {
        fn begin_segment_decode(&mut self, segment: &Arc<Segment>, mesh: Option<&DecodedMesh>) {
            self.events
                .lock()
                .push(Event::Segment(segment.segment_index, mesh.is_some_and(|m| m.vertices.len() == 4)));
        }

        fn decode_frame(&mut self, frame: &Arc<Frame>, colors: Option<&DecodedColors>) {
            self.events
                .lock()
                .push(Event::Frame(frame.frame_index, colors.map_or(0, |c| c.colors.len())));
        }

        fn on_swap_complete(&mut self) {
            self.events.lock().push(Event::Swap);
        }
    }

    fn decoder(frames: &[u32], config: DecoderConfig) -> (AvvDecoder, Arc<Mutex<Vec<Event>>>) {
        let sink = RecordingSink::default();
        let events = Arc::clone(&sink.events);
        let reader = Arc::new(AvvReader::new(MemoryPool::new(), ReaderConfig::default()));
        let mut decoder = AvvDecoder::new(reader, Box::new(sink), config);
        decoder
            .open(AvvAsset::from_package(fixtures::package(frames)))
            .unwrap();
        (decoder, events)
    }

    /// Tick (driving the reader) until `state` is reached.
    fn run_until(decoder: &mut AvvDecoder, state: DecoderState, seen: &mut Vec<DecoderState>) {
        for _ in 0..10_000 {
            decoder.reader().update();
            decoder.tick();
            if seen.last() != Some(&decoder.state()) {
                seen.push(decoder.state());
            }
            if decoder.state() == state {
                return;
            }
            std::thread::yield_now();
        }
        panic!("decoder never reached {state:?}, saw {seen:?}");
    }

    #[test]
    fn test_full_cycle() {
        let (mut decoder, events) = decoder(&[2, 2], DecoderConfig::default());
        let signals = decoder.signals();
        let mut seen = Vec::new();

        decoder.set_frame(0, false);
        run_until(&mut decoder, DecoderState::WaitingGpu, &mut seen);
        assert_eq!(
            seen,
            vec![DecoderState::WaitingCpu, DecoderState::FinishedCpu, DecoderState::WaitingGpu]
        );
        assert_eq!(decoder.current_frame(), Some(0));
        assert_eq!(decoder.decoded_segment(), Some(0));
        assert_eq!(*events.lock(), vec![Event::Segment(0, true), Event::Frame(0, 4)]);

        // Still waiting without a signal
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::WaitingGpu);

        signals.signal_gpu_complete();
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::FinishedGpu);
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Idle);
        assert_eq!(events.lock().last(), Some(&Event::Swap));

        // Next frame in the same segment: no segment decode, no swap
        events.lock().clear();
        decoder.set_frame(1, false);
        run_until(&mut decoder, DecoderState::WaitingGpu, &mut Vec::new());
        signals.signal_gpu_complete();
        run_until(&mut decoder, DecoderState::Idle, &mut Vec::new());
        assert_eq!(*events.lock(), vec![Event::Frame(1, 4)]);
    }

    #[test]
    fn test_lookahead_requests_next_frames() {
        let (mut decoder, _) = decoder(&[2, 2], DecoderConfig::default());
        decoder.set_frame(3, false);
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::WaitingCpu);
        // Frame 3 plus wrapped lookahead to frame 0
        assert!(decoder.reader().has_active_frame(3));
        assert!(decoder.reader().has_active_frame(0));
    }

    #[test]
    fn test_culled_goes_through_error() {
        let (mut decoder, _) = decoder(&[2], DecoderConfig::default());
        let signals = decoder.signals();
        decoder.set_frame(0, false);
        run_until(&mut decoder, DecoderState::WaitingGpu, &mut Vec::new());

        signals.signal_culled();
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Error);
        assert_eq!(decoder.current_frame(), None);
        assert_eq!(decoder.decoded_segment(), None);
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_missing_data_at_submit() {
        let (mut decoder, _) = decoder(&[2], DecoderConfig::default());
        decoder.set_frame(0, false);
        run_until(&mut decoder, DecoderState::FinishedCpu, &mut Vec::new());
        decoder.cache().empty();
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Error);
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_set_frame_same_frame_ignored() {
        let (mut decoder, _) = decoder(&[2], DecoderConfig::default());
        decoder.set_frame(0, false);
        run_until(&mut decoder, DecoderState::WaitingGpu, &mut Vec::new());
        decoder.set_frame(0, false);
        assert_eq!(decoder.requested_frame(), None);
        decoder.set_frame(0, true);
        assert_eq!(decoder.requested_frame(), Some(0));
        assert_eq!(decoder.current_frame(), None);
        decoder.set_frame(99, false);
        assert_eq!(decoder.requested_frame(), Some(0));
    }

    #[test]
    fn test_immediate_mode() {
        let config = DecoderConfig {
            immediate_mode: true,
            backend: DecodeBackend::GpuCompute,
            ..Default::default()
        };
        let (mut decoder, events) = decoder(&[2, 1], config);
        decoder.set_frame(2, false);
        assert_eq!(decoder.state(), DecoderState::WaitingGpu);
        assert_eq!(decoder.current_frame(), Some(2));
        assert_eq!(*events.lock(), vec![Event::Segment(1, false), Event::Frame(2, 0)]);

        decoder.signals().signal_gpu_complete();
        decoder.tick();
        decoder.tick();
        assert_eq!(decoder.state(), DecoderState::Idle);

        assert!(decoder.set_frame_immediate(7).is_err());
    }

    #[test]
    fn test_upload_pins_until_gpu_finishes() {
        let (mut decoder, _) = decoder(&[3], DecoderConfig::default());
        let signals = decoder.signals();
        decoder.set_frame(0, false);
        run_until(&mut decoder, DecoderState::WaitingGpu, &mut Vec::new());

        // Processed but pinned by the in-flight upload
        decoder.update_data_cache();
        assert!(decoder.cache().has_frame(0));

        signals.signal_gpu_complete();
        run_until(&mut decoder, DecoderState::Idle, &mut Vec::new());
        decoder.update_data_cache();
        assert!(!decoder.cache().has_frame(0));
    }
}
