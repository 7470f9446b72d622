//! Decode backends and the GPU-side collaborator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cpu::{DecodedColors, DecodedMesh};
use crate::format::{Frame, Segment};

/// Where segment and frame data are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeBackend {
    /// Decode vertices, uvs, indices and colors on the thread pool.
    #[default]
    Cpu,
    /// Hand raw container blocks to compute kernels.
    GpuCompute,
}

/// Receiver of submitted segment/frame updates.
///
/// Implementations pin the data they upload asynchronously with
/// [`Segment::begin_upload`] / [`Frame::begin_upload`] and report back
/// through [`DecoderSignals`].
pub trait GpuDecodeSink: Send {
    /// A new segment becomes current. `mesh` is set for the CPU backend.
    fn begin_segment_decode(&mut self, segment: &Arc<Segment>, mesh: Option<&DecodedMesh>);

    /// Decode one frame against the current segment.
    fn decode_frame(&mut self, frame: &Arc<Frame>, colors: Option<&DecodedColors>);

    /// Called once the frame that introduced a new segment has finished on the GPU.
    fn on_swap_complete(&mut self) {}
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl GpuDecodeSink for NullSink {
    fn begin_segment_decode(&mut self, _segment: &Arc<Segment>, _mesh: Option<&DecodedMesh>) {}

    fn decode_frame(&mut self, _frame: &Arc<Frame>, _colors: Option<&DecodedColors>) {}
}

/// Completion flags set by the GPU side, consumed by the decoder tick.
#[derive(Debug, Default)]
pub struct DecoderSignals {
    gpu_complete: AtomicBool,
    culled: AtomicBool,
}

impl DecoderSignals {
    /// The submitted update finished.
    pub fn signal_gpu_complete(&self) {
        self.gpu_complete.store(true, Ordering::Release);
    }

    /// The submitted update was dropped without running.
    pub fn signal_culled(&self) {
        self.culled.store(true, Ordering::Release);
    }

    pub(crate) fn take_gpu_complete(&self) -> bool {
        self.gpu_complete.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_culled(&self) -> bool {
        self.culled.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear(&self) {
        self.gpu_complete.store(false, Ordering::Release);
        self.culled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_consumed_once() {
        let signals = DecoderSignals::default();
        assert!(!signals.take_gpu_complete());
        signals.signal_gpu_complete();
        assert!(signals.take_gpu_complete());
        assert!(!signals.take_gpu_complete());
        signals.signal_culled();
        signals.clear();
        assert!(!signals.take_culled());
    }

    #[test]
    fn test_backend_serde() {
        let json = serde_json::to_string(&DecodeBackend::GpuCompute).unwrap();
        assert_eq!(json, "\"gpu_compute\"");
        let back: DecodeBackend = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(back, DecodeBackend::Cpu);
    }
}
