//! Player runtime context.
//!
//! Owns what every player instance shares: the block [`MemoryPool`] and the
//! worker thread pool that runs reader updates, storage reads and CPU decode. Create one
//! with [`PlayerRuntime::init`] and pass it to readers and decoders.

mod settings;

pub use settings::PlayerSettings;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::decoder::{AvvDecoder, GpuDecodeSink};
use crate::pool::MemoryPool;
use crate::reader::AvvReader;
use crate::util::{Error, Result};

/// Shared pool, worker threads and settings.
pub struct PlayerRuntime {
    settings: PlayerSettings,
    pool: MemoryPool,
    thread_pool: Arc<ThreadPool>,
    last_cleanup: Mutex<Instant>,
    shut_down: AtomicBool,
}

impl PlayerRuntime {
    /// Build the runtime: memory pool plus a named worker pool.
    #[tracing::instrument(skip_all, fields(threads = settings.worker_threads))]
    pub fn init(settings: PlayerSettings) -> Result<Arc<Self>> {
        let mut settings = settings;
        settings.validate();

        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(|i| format!("avv-worker-{i}"))
            .build()
            .map_err(|e| Error::other(format!("failed to start worker pool: {e}")))?;

        info!(
            threads = thread_pool.current_num_threads(),
            backend = ?settings.decode_backend,
            "player runtime started"
        );

        Ok(Arc::new(Self {
            settings,
            pool: MemoryPool::new(),
            thread_pool: Arc::new(thread_pool),
            last_cleanup: Mutex::new(Instant::now()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.thread_pool
    }

    /// A reader allocating from the shared pool and reading on the worker pool.
    pub fn create_reader(&self) -> Arc<AvvReader> {
        Arc::new(
            AvvReader::new(self.pool.clone(), self.settings.reader_config())
                .with_thread_pool(Arc::clone(&self.thread_pool)),
        )
    }

    /// A decoder with its own reader, decoding on the worker pool.
    pub fn create_decoder(&self, sink: Box<dyn GpuDecodeSink>) -> AvvDecoder {
        AvvDecoder::new(self.create_reader(), sink, self.settings.decoder_config())
            .with_thread_pool(Arc::clone(&self.thread_pool))
    }

    /// Run one reader cycle on the worker pool.
    pub fn spawn_reader_update(&self, reader: &Arc<AvvReader>) {
        if self.is_shut_down() {
            return;
        }
        let reader = Arc::clone(reader);
        self.thread_pool.spawn(move || {
            reader.update();
        });
    }

    /// Per-frame driver: schedule the reader, advance the decoder, and clean
    /// the pool when due.
    pub fn tick(&self, decoder: &mut AvvDecoder) {
        self.spawn_reader_update(decoder.reader());
        decoder.tick();
        self.maybe_clean_up();
    }

    /// Run [`MemoryPool::clean_up`] if the cleanup interval has elapsed.
    ///
    /// Returns the bytes released when a clean-up ran.
    pub fn maybe_clean_up(&self) -> Option<usize> {
        let interval = Duration::from_millis(self.settings.cleanup_interval_ms);
        {
            let mut last = self.last_cleanup.lock();
            if last.elapsed() < interval {
                return None;
            }
            *last = Instant::now();
        }
        let freed = self.pool.clean_up();
        if freed > 0 {
            debug!(freed, "periodic pool clean-up");
        }
        Some(freed)
    }

    /// Release pooled memory and stop scheduling work.
    ///
    /// Blocks still held by readers or caches are freed when dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let freed = self.pool.empty();
        info!(freed, "player runtime shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PlayerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerRuntime")
            .field("threads", &self.thread_pool.current_num_threads())
            .field("pool", &self.pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecoderState, NullSink};
    use crate::format::fixtures;
    use crate::storage::{AvvAsset, MemoryStorage, Storage};

    /// Records the thread each read runs on.
    struct ThreadLog {
        inner: MemoryStorage,
        threads: Mutex<Vec<String>>,
    }

    impl Storage for ThreadLog {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn read_sync(&self, offset: u64, out: &mut [u8]) -> Result<()> {
            let name = std::thread::current().name().unwrap_or_default().to_owned();
            self.threads.lock().push(name);
            self.inner.read_sync(offset, out)
        }
    }

    fn runtime(settings: PlayerSettings) -> Arc<PlayerRuntime> {
        PlayerRuntime::init(PlayerSettings {
            worker_threads: 2,
            ..settings
        })
        .unwrap()
    }

    #[test]
    fn test_init_and_shutdown() {
        let rt = runtime(PlayerSettings::default());
        assert_eq!(rt.thread_pool().current_num_threads(), 2);
        let reader = rt.create_reader();
        reader
            .open(AvvAsset::from_package(fixtures::package(&[2])))
            .unwrap();
        assert!(rt.pool().stats().free_bytes > 0);

        rt.shutdown();
        assert!(rt.is_shut_down());
        assert_eq!(rt.pool().stats().free_bytes, 0);
        rt.shutdown();
    }

    #[test]
    fn test_reads_run_on_workers() {
        let rt = runtime(PlayerSettings::default());
        let package = fixtures::package(&[3]);
        let storage = Arc::new(ThreadLog {
            inner: MemoryStorage::new(package.blob),
            threads: Mutex::new(Vec::new()),
        });
        let reader = rt.create_reader();
        reader
            .open(AvvAsset::new(package.layout, Arc::clone(&storage) as Arc<dyn Storage>))
            .unwrap();
        storage.threads.lock().clear();

        assert!(reader.add_request(Some(0), Some(0), true, false));
        let mut finished = None;
        for _ in 0..10_000 {
            reader.update();
            finished = reader.get_finished_request();
            if finished.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        assert!(finished.unwrap().is_complete());

        // Segment, frame and texture reads
        let threads = storage.threads.lock();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| t.starts_with("avv-worker-")), "{threads:?}");
    }

    #[test]
    fn test_cleanup_interval() {
        let rt = runtime(PlayerSettings {
            cleanup_interval_ms: 60_000,
            ..Default::default()
        });
        assert_eq!(rt.maybe_clean_up(), None);

        let rt = runtime(PlayerSettings {
            cleanup_interval_ms: 1,
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(rt.maybe_clean_up(), Some(0));
    }

    #[test]
    fn test_runtime_drives_decoder() {
        let rt = runtime(PlayerSettings::default());
        let mut decoder = rt.create_decoder(Box::new(NullSink));
        decoder
            .open(AvvAsset::from_package(fixtures::package(&[3])))
            .unwrap();
        let signals = decoder.signals();

        decoder.set_frame(1, false);
        for _ in 0..10_000 {
            rt.tick(&mut decoder);
            if decoder.state() == DecoderState::WaitingGpu {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        assert_eq!(decoder.state(), DecoderState::WaitingGpu);
        assert_eq!(decoder.current_frame(), Some(1));

        signals.signal_gpu_complete();
        rt.tick(&mut decoder);
        rt.tick(&mut decoder);
        assert_eq!(decoder.state(), DecoderState::Idle);
    }
}
