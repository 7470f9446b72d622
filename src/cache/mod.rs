//! Short-horizon cache of parsed segments and frames.
//!
//! Holds what the decoder is about to need around the playback cursor and
//! evicts the rest. Eviction is direction aware: during reverse playback the
//! "behind" side is the higher indices.
//!
//! Entries are shared as `Arc`s, so an evicted segment stays alive for any
//! consumer still holding it. Entries with active uploads are never evicted.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::format::{Frame, Segment};

/// How far ahead of the cursor entries are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    pub segments_ahead: u32,
    pub frames_ahead: u32,
}

impl Default for CacheWindow {
    fn default() -> Self {
        Self {
            segments_ahead: 2,
            frames_ahead: 3,
        }
    }
}

/// Result of one [`DataCache::free_stale_data`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub segments: usize,
    pub frames: usize,
}

#[derive(Default)]
struct CacheInner {
    segments: Vec<Arc<Segment>>,
    frames: Vec<Arc<Frame>>,
}

/// Thread-safe segment/frame cache.
#[derive(Default)]
pub struct DataCache {
    window: CacheWindow,
    inner: Mutex<CacheInner>,
}

/// Whether entry `index` falls outside the window around `cursor`.
fn outside_window(index: u32, cursor: Option<u32>, ahead: u32, reverse: bool) -> bool {
    let index = i64::from(index);
    let cursor = cursor.map_or(-1, i64::from);
    let ahead = i64::from(ahead);
    if reverse {
        index > cursor || index < cursor - ahead
    } else {
        index < cursor || index > cursor + ahead
    }
}

impl DataCache {
    pub fn new(window: CacheWindow) -> Self {
        Self {
            window,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn window(&self) -> CacheWindow {
        self.window
    }

    /// Insert a segment. An entry with the same index is kept and returned instead.
    pub fn add_segment(&self, segment: Segment) -> Arc<Segment> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .segments
            .iter()
            .find(|s| s.segment_index == segment.segment_index)
        {
            return Arc::clone(existing);
        }
        let segment = Arc::new(segment);
        inner.segments.push(Arc::clone(&segment));
        segment
    }

    /// Insert a frame. An entry with the same index is kept and returned instead.
    pub fn add_frame(&self, frame: Frame) -> Arc<Frame> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.frames.iter().find(|f| f.frame_index == frame.frame_index) {
            return Arc::clone(existing);
        }
        let frame = Arc::new(frame);
        inner.frames.push(Arc::clone(&frame));
        frame
    }

    pub fn has_segment(&self, index: u32) -> bool {
        self.inner.lock().segments.iter().any(|s| s.segment_index == index)
    }

    pub fn has_frame(&self, index: u32) -> bool {
        self.inner.lock().frames.iter().any(|f| f.frame_index == index)
    }

    pub fn get_segment(&self, index: u32) -> Option<Arc<Segment>> {
        self.inner
            .lock()
            .segments
            .iter()
            .find(|s| s.segment_index == index)
            .cloned()
    }

    pub fn get_frame(&self, index: u32) -> Option<Arc<Frame>> {
        self.inner
            .lock()
            .frames
            .iter()
            .find(|f| f.frame_index == index)
            .cloned()
    }

    /// Both entries, looked up under one lock. `None` unless both are cached.
    pub fn get_segment_and_frame(&self, segment: u32, frame: u32) -> Option<(Arc<Segment>, Arc<Frame>)> {
        let inner = self.inner.lock();
        let s = inner.segments.iter().find(|s| s.segment_index == segment)?;
        let f = inner.frames.iter().find(|f| f.frame_index == frame)?;
        Some((Arc::clone(s), Arc::clone(f)))
    }

    /// Evict entries that are behind the cursor, too far ahead of it, or
    /// already processed, unless they have uploads in flight.
    pub fn free_stale_data(&self, segment: Option<u32>, frame: Option<u32>, reverse: bool) -> Eviction {
        let window = self.window;
        let mut inner = self.inner.lock();

        let before = (inner.segments.len(), inner.frames.len());
        inner.segments.retain(|s| {
            let stale = s.is_processed()
                || outside_window(s.segment_index, segment, window.segments_ahead, reverse);
            !stale || s.active_uploads() > 0
        });
        inner.frames.retain(|f| {
            let stale =
                f.is_processed() || outside_window(f.frame_index, frame, window.frames_ahead, reverse);
            !stale || f.active_uploads() > 0
        });

        let eviction = Eviction {
            segments: before.0 - inner.segments.len(),
            frames: before.1 - inner.frames.len(),
        };
        if eviction != Eviction::default() {
            debug!(
                ?segment,
                ?frame,
                reverse,
                segments = eviction.segments,
                frames = eviction.frames,
                "evicted stale cache entries"
            );
        }
        eviction
    }

    /// Drop every entry.
    pub fn empty(&self) {
        let mut inner = self.inner.lock();
        inner.segments.clear();
        inner.frames.clear();
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Total number of cached entries.
    #[inline]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.segments.len() + inner.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pool bytes held by cached entries.
    pub fn byte_size(&self) -> usize {
        let inner = self.inner.lock();
        inner.segments.iter().map(|s| s.byte_size()).sum::<usize>()
            + inner.frames.iter().map(|f| f.byte_size()).sum::<usize>()
    }
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("window", &self.window)
            .field("segments", &self.segment_count())
            .field("frames", &self.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{fixtures, ContainerId, Limits, Package};
    use crate::pool::BlockRef;

    fn block_of(bytes: &[u8]) -> BlockRef {
        let mut block = BlockRef::detached(bytes.len());
        block.get_mut().unwrap()[..bytes.len()].copy_from_slice(bytes);
        block
    }

    fn segment(pkg: &Package, index: u32) -> Segment {
        let bytes = pkg.container(ContainerId::Segment(index)).unwrap();
        Segment::parse(index, block_of(bytes), bytes.len(), &Limits::default()).unwrap()
    }

    fn frame(pkg: &Package, index: u32) -> Frame {
        let bytes = pkg.container(ContainerId::Frame(index)).unwrap();
        Frame::parse(index, block_of(bytes), bytes.len(), &Limits::default()).unwrap()
    }

    fn filled(segments: u32, frames: u32) -> DataCache {
        let pkg = fixtures::package(&vec![1; segments.max(frames) as usize]);
        let cache = DataCache::default();
        for s in 0..segments {
            cache.add_segment(segment(&pkg, s));
        }
        for f in 0..frames {
            cache.add_frame(frame(&pkg, f));
        }
        cache
    }

    fn frame_indices(cache: &DataCache) -> Vec<u32> {
        let mut v: Vec<_> = (0..32).filter(|&i| cache.has_frame(i)).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_window_math() {
        assert!(!outside_window(0, None, 3, false));
        assert!(outside_window(4, Some(0), 3, false));
        assert!(!outside_window(3, Some(0), 3, false));
        assert!(outside_window(2, Some(3), 3, false));
        assert!(outside_window(4, Some(3), 3, true));
        assert!(!outside_window(0, Some(3), 3, true));
        assert!(outside_window(0, Some(4), 3, true));
        // No cursor: everything is "behind" in reverse
        assert!(outside_window(0, None, 3, true));
    }

    #[test]
    fn test_add_dedups() {
        let pkg = fixtures::package(&[2]);
        let cache = DataCache::default();
        let a = cache.add_frame(frame(&pkg, 0));
        let b = cache.add_frame(frame(&pkg, 0));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.frame_count(), 1);
        assert!(cache.get_segment_and_frame(0, 0).is_none());
        cache.add_segment(segment(&pkg, 0));
        assert!(cache.get_segment_and_frame(0, 0).is_some());
        assert!(cache.byte_size() > 0);
    }

    #[test]
    fn test_forward_eviction() {
        let cache = filled(4, 10);
        let evicted = cache.free_stale_data(Some(1), Some(4), false);
        assert_eq!(frame_indices(&cache), vec![4, 5, 6, 7]);
        assert_eq!(evicted.frames, 6);
        // Segments 1..=3 are within two ahead of segment 1
        assert_eq!(evicted.segments, 1);
        assert!(!cache.has_segment(0));
    }

    #[test]
    fn test_reverse_eviction() {
        let cache = filled(1, 10);
        cache.free_stale_data(Some(0), Some(6), true);
        assert_eq!(frame_indices(&cache), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_processed_evicted() {
        let cache = filled(1, 3);
        cache.get_frame(1).unwrap().mark_processed();
        cache.free_stale_data(Some(0), Some(0), false);
        assert_eq!(frame_indices(&cache), vec![0, 2]);
    }

    #[test]
    fn test_active_upload_pins_entry() {
        let cache = filled(1, 6);
        let frame = cache.get_frame(0).unwrap();
        let guard = frame.begin_upload();
        frame.mark_processed();
        cache.free_stale_data(Some(0), Some(5), false);
        assert!(cache.has_frame(0));
        drop(guard);
        cache.free_stale_data(Some(0), Some(5), false);
        assert!(!cache.has_frame(0));
        // The evicted frame lives on for the holder of the Arc
        assert_eq!(frame.frame_index, 0);
    }

    #[test]
    fn test_empty() {
        let cache = filled(2, 2);
        assert_eq!(cache.len(), 4);
        cache.empty();
        assert!(cache.is_empty());
    }
}
