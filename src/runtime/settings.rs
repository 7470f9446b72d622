//! Persistent player settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::CacheWindow;
use crate::decoder::{DecodeBackend, DecoderConfig};
use crate::reader::ReaderConfig;
use crate::util::Result;

/// Player configuration, stored as JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    // Threads
    /// Worker threads for reader updates and CPU decode (0 = one per core).
    pub worker_threads: usize,

    // Decoding
    pub decode_backend: DecodeBackend,
    pub immediate_mode: bool,
    pub request_textures: bool,

    // Streaming
    pub preallocated_containers: usize,
    pub max_in_flight: usize,
    pub lookahead_frames: u32,

    // Cache window
    pub segments_ahead: u32,
    pub frames_ahead: u32,

    // Memory
    pub cleanup_interval_ms: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            decode_backend: DecodeBackend::Cpu,
            immediate_mode: false,
            request_textures: true,
            preallocated_containers: 4,
            max_in_flight: 1,
            lookahead_frames: 2,
            segments_ahead: 2,
            frames_ahead: 3,
            cleanup_interval_ms: 250,
        }
    }
}

impl PlayerSettings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&json)?;
        settings.validate();
        Ok(settings)
    }

    /// Load settings, falling back to defaults if the file is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|e| {
            if path.exists() {
                warn!(path = %path.display(), error = %e, "using default settings");
            }
            Self::default()
        })
    }

    /// Save settings as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values the pipeline cannot run with.
    pub fn validate(&mut self) {
        if self.max_in_flight == 0 {
            self.max_in_flight = 1;
        }
        if self.cleanup_interval_ms == 0 {
            self.cleanup_interval_ms = 250;
        }
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            max_in_flight: self.max_in_flight.max(1),
            preallocated_containers: self.preallocated_containers,
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            backend: self.decode_backend,
            immediate_mode: self.immediate_mode,
            request_textures: self.request_textures,
            lookahead_frames: self.lookahead_frames,
            cache_window: CacheWindow {
                segments_ahead: self.segments_ahead,
                frames_ahead: self.frames_ahead,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: PlayerSettings =
            serde_json::from_str(r#"{ "frames_ahead": 5, "decode_backend": "gpu_compute" }"#).unwrap();
        assert_eq!(settings.frames_ahead, 5);
        assert_eq!(settings.decode_backend, DecodeBackend::GpuCompute);
        assert_eq!(settings.segments_ahead, 2);
        assert_eq!(settings.cleanup_interval_ms, 250);
        assert_eq!(settings.decoder_config().cache_window.frames_ahead, 5);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        let settings = PlayerSettings {
            worker_threads: 3,
            max_in_flight: 0,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        let loaded = PlayerSettings::load(&path).unwrap();
        assert_eq!(loaded.worker_threads, 3);
        // Validated on load
        assert_eq!(loaded.max_in_flight, 1);
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(PlayerSettings::load(&path).is_err());
        assert_eq!(PlayerSettings::load_or_default(&path), PlayerSettings::default());
        assert_eq!(
            PlayerSettings::load_or_default(dir.path().join("missing.json")),
            PlayerSettings::default()
        );
    }
}
