//! Multi-producer/single-consumer ingestion pipeline
//!
//! The pipeline owns a small set of bounded queues and one writer
//! worker. Producers obtain a [`Spout`] bound to one queue; the worker
//! drains all queues round-robin and writes into the storage
//! connection. Writes from a single spout reach storage in FIFO order;
//! writes across spouts on different queues have no global ordering
//! guarantee.
//!
//! Shutdown uses a poison-pill drain: [`IngestionPipeline::stop`]
//! pushes one poison per queue, the worker counts them and verifies
//! every queue is empty before crossing the stop rendezvous. Entries
//! still queued at that moment are logged as lost.

mod queue;
mod spout;

pub use queue::BoundedQueue;
pub use spout::{BackoffPolicy, ErrorCallback, Spout};

use crate::storage::Storage;
use crate::{config, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spout::Envelope;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of ingestion queues
    pub n_queues: usize,
    /// Capacity of each queue (must be a power of two)
    pub queue_capacity: usize,
    /// Sample slots per spout
    pub pool_size: usize,
    /// Producer backoff policy when a spout pool is saturated
    pub backoff: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_queues: config::N_QUEUES,
            queue_capacity: config::QUEUE_CAPACITY,
            pool_size: config::POOL_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The fan-in structure connecting many spouts to one storage-writing
/// worker thread.
pub struct IngestionPipeline {
    storage: Arc<dyn Storage>,
    queues: Vec<Arc<BoundedQueue<Envelope>>>,
    config: PipelineConfig,
    next_spout: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
    start_barrier: Arc<Barrier>,
    stop_rx: Mutex<Option<Receiver<()>>>,
}

impl IngestionPipeline {
    /// Create a pipeline over the given storage connection. The worker
    /// is not spawned until [`IngestionPipeline::start`].
    pub fn new(storage: Arc<dyn Storage>, config: PipelineConfig) -> Self {
        assert!(config.n_queues > 0, "pipeline needs at least one queue");
        let queues = (0..config.n_queues)
            .map(|_| Arc::new(BoundedQueue::with_capacity(config.queue_capacity)))
            .collect();
        Self {
            storage,
            queues,
            config,
            next_spout: AtomicUsize::new(0),
            worker: Mutex::new(None),
            start_barrier: Arc::new(Barrier::new(2)),
            stop_rx: Mutex::new(None),
        }
    }

    /// Spawn the worker thread. Returns only after the worker has
    /// crossed the start rendezvous, so the caller may assume it is
    /// live.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::BadArg("pipeline is already running".into()));
        }

        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(0);
        *self.stop_rx.lock() = Some(stop_rx);

        let queues = self.queues.clone();
        let storage = Arc::clone(&self.storage);
        let start_barrier = Arc::clone(&self.start_barrier);

        let handle = thread::Builder::new()
            .name("emberdb-ingestion".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    info!("starting pipeline worker");
                    start_barrier.wait();
                    info!("pipeline worker started");
                    run_worker(&queues, storage.as_ref(), &stop_tx);
                }));
                if let Err(payload) = result {
                    let cause = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    error!("fatal error in ingestion pipeline worker: {}", cause);
                    panic::resume_unwind(payload);
                }
            })?;
        *worker = Some(handle);
        drop(worker);

        self.start_barrier.wait();
        info!("pipeline started");
        Ok(())
    }

    /// Create a new spout bound to the next queue round-robin.
    pub fn make_spout(&self) -> Spout {
        let ix = self.next_spout.fetch_add(1, Ordering::Relaxed);
        Spout::new(
            Arc::clone(&self.queues[ix % self.queues.len()]),
            self.config.backoff,
            self.config.pool_size,
            Arc::clone(&self.storage),
        )
    }

    /// Drain and join the worker.
    ///
    /// Pushes one poison pill per queue and waits for the worker to
    /// process them all. A worker that has already died is detected by
    /// a periodic health check instead of waiting forever; its panic is
    /// re-thrown after the join.
    pub fn stop(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| Error::BadArg("pipeline is not running".into()))?;
        let stop_rx = self
            .stop_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Fatal("pipeline stop channel missing".into()))?;

        info!("stopping pipeline, pushing poison to queues");
        for queue in &self.queues {
            let mut envelope = Envelope::Poison;
            loop {
                if handle.is_finished() {
                    // A dead worker drains nothing.
                    break;
                }
                match queue.push(envelope) {
                    Ok(()) => break,
                    Err(back) => {
                        envelope = back;
                        thread::yield_now();
                    }
                }
            }
        }

        info!("waiting for pipeline worker to drain");
        loop {
            match stop_rx.recv_timeout(Duration::from_millis(config::STOP_CHECK_INTERVAL_MS)) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if handle.is_finished() {
                        break;
                    }
                    warn!("pipeline worker still draining");
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match handle.join() {
            Ok(()) => {
                info!("pipeline stopped");
                Ok(())
            }
            Err(payload) => {
                error!("pipeline worker panicked, re-throwing");
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Worker write loop: round-robin over the queues, releasing each slot
/// back to its spout after the storage write and reporting failures
/// through the spout's error callback.
fn run_worker(queues: &[Arc<BoundedQueue<Envelope>>], storage: &dyn Storage, stop_tx: &SyncSender<()>) {
    let n_queues = queues.len();
    let mut poison_count = 0usize;
    let mut idle_count = 0u32;
    let mut ix = 0usize;

    loop {
        let queue = &queues[ix % n_queues];
        ix = ix.wrapping_add(1);

        match queue.pop() {
            Some(Envelope::Sample { shared, slot }) => {
                idle_count = 0;
                let sample = shared.read_slot(slot);
                let status = storage.write(&sample);
                let released = shared.release_one();
                if let Err(err) = status {
                    shared.notify_error(&err, released);
                }
            }
            Some(Envelope::Poison) => {
                idle_count = 0;
                poison_count += 1;
                if poison_count == n_queues {
                    for queue in queues {
                        if !queue.is_empty() {
                            warn!("queue not empty at shutdown, some data will be lost");
                        }
                    }
                    info!("stopping pipeline worker");
                    let _ = stop_tx.send(());
                    info!("pipeline worker stopped");
                    return;
                }
            }
            None => {
                idle_count = idle_count.saturating_add(1);
                if idle_count > config::IDLE_THRESHOLD && idle_count % n_queues as u32 == 0 {
                    // Quiescent: check all queues once more, then nap.
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Cursor;
    use crate::{ParamId, Sample, SearchQuery};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU64};

    #[derive(Default)]
    struct MockStorage {
        writes: Mutex<Vec<Sample>>,
        counter: AtomicU64,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
        blocked: AtomicBool,
    }

    impl MockStorage {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_at(n: u64) -> Arc<Self> {
            Arc::new(Self {
                fail_at: Some(n),
                ..Self::default()
            })
        }

        fn panicking_at(n: u64) -> Arc<Self> {
            Arc::new(Self {
                panic_at: Some(n),
                ..Self::default()
            })
        }

        fn blocked() -> Arc<Self> {
            let storage = Self::default();
            storage.blocked.store(true, Ordering::Release);
            Arc::new(storage)
        }

        fn unblock(&self) {
            self.blocked.store(false, Ordering::Release);
        }

        fn observed(&self) -> usize {
            self.writes.lock().len()
        }

        fn timestamps_for(&self, param: ParamId) -> Vec<i64> {
            self.writes
                .lock()
                .iter()
                .filter(|s| s.param_id == param)
                .map(|s| s.timestamp)
                .collect()
        }
    }

    impl Storage for MockStorage {
        fn write(&self, sample: &Sample) -> Result<()> {
            while self.blocked.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_at == Some(n) {
                panic!("storage write blew up");
            }
            self.writes.lock().push(*sample);
            if self.fail_at == Some(n) {
                return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "injected")));
            }
            Ok(())
        }

        fn search(&self, _query: SearchQuery) -> Result<Box<dyn Cursor + '_>> {
            Err(Error::BadArg("mock storage has no search".into()))
        }

        fn series_to_param_id(&self, name: &[u8]) -> Result<ParamId> {
            Ok(name.len() as ParamId)
        }

        fn param_id_to_series(&self, _id: ParamId, _buf: &mut [u8]) -> Result<usize> {
            Err(Error::NotFound("mock storage has no registry".into()))
        }
    }

    fn small_config(backoff: BackoffPolicy) -> PipelineConfig {
        PipelineConfig {
            n_queues: 4,
            queue_capacity: 64,
            pool_size: 16,
            backoff,
        }
    }

    #[test]
    fn test_start_stop() {
        let storage = MockStorage::new();
        let pipeline = IngestionPipeline::new(storage, small_config(BackoffPolicy::LinearBackoff));

        assert!(matches!(pipeline.stop(), Err(Error::BadArg(_))));
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(Error::BadArg(_))));
        pipeline.stop().unwrap();
        assert!(matches!(pipeline.stop(), Err(Error::BadArg(_))));
    }

    #[test]
    fn test_concurrent_spouts_drain_completely() {
        const SPOUTS: u64 = 8;
        const SAMPLES: u64 = 10_000;

        let storage = MockStorage::new();
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            small_config(BackoffPolicy::LinearBackoff),
        ));
        pipeline.start().unwrap();

        let mut producers = Vec::new();
        for param in 0..SPOUTS {
            let mut spout = pipeline.make_spout();
            producers.push(thread::spawn(move || {
                for t in 0..SAMPLES {
                    assert!(spout.write(Sample::new(param, t as i64, t as f64)));
                }
                (spout.created(), spout.in_flight() <= 16)
            }));
        }
        for producer in producers {
            let (created, bounded) = producer.join().unwrap();
            assert_eq!(created, SAMPLES);
            assert!(bounded);
        }

        pipeline.stop().unwrap();

        assert_eq!(storage.observed(), (SPOUTS * SAMPLES) as usize);
        // Per-spout FIFO: each series arrived in submission order.
        for param in 0..SPOUTS {
            let times = storage.timestamps_for(param);
            assert_eq!(times.len(), SAMPLES as usize);
            assert!(times.windows(2).all(|w| w[0] < w[1]), "series {} out of order", param);
        }
    }

    #[test]
    fn test_throttle_drops_against_blocked_storage() {
        let storage = MockStorage::blocked();
        let pipeline = IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            PipelineConfig {
                n_queues: 1,
                queue_capacity: 64,
                pool_size: 4,
                backoff: BackoffPolicy::Throttle,
            },
        );
        pipeline.start().unwrap();

        let mut spout = pipeline.make_spout();
        let mut accepted = 0u64;
        let mut dropped = 0u64;
        for t in 0..50 {
            if spout.write(Sample::new(1, t, 0.0)) {
                accepted += 1;
            } else {
                dropped += 1;
            }
        }

        // The pool saturates while storage hangs, so most writes drop
        // instead of blocking the producer.
        assert!(dropped > 0);
        assert_eq!(accepted, spout.created());
        assert_eq!(dropped, 50 - spout.created());

        storage.unblock();
        pipeline.stop().unwrap();
        assert_eq!(storage.observed(), accepted as usize);
    }

    #[test]
    fn test_error_callback_reports_failed_write() {
        let storage = MockStorage::failing_at(100);
        let pipeline = IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            PipelineConfig {
                n_queues: 1,
                queue_capacity: 64,
                pool_size: 16,
                backoff: BackoffPolicy::LinearBackoff,
            },
        );
        pipeline.start().unwrap();

        let mut spout = pipeline.make_spout();
        let reports: Arc<Mutex<Vec<(bool, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        spout.set_error_cb(Arc::new(move |error, released| {
            sink.lock().push((matches!(error, Error::Io(_)), released));
        }));

        for t in 0..200 {
            assert!(spout.write(Sample::new(1, t, 0.0)));
        }
        pipeline.stop().unwrap();

        // Writes continued after the failure.
        assert_eq!(storage.observed(), 200);
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(*reports.first().unwrap(), (true, 100));
    }

    #[test]
    fn test_poison_drain_observes_everything_enqueued() {
        const K: u64 = 100;

        let storage = MockStorage::new();
        let pipeline = IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            small_config(BackoffPolicy::LinearBackoff),
        );
        pipeline.start().unwrap();

        let mut spout = pipeline.make_spout();
        for t in 0..K {
            assert!(spout.write(Sample::new(3, t as i64, 1.0)));
        }
        pipeline.stop().unwrap();

        // Everything enqueued before stop() was processed; nothing is
        // left in flight.
        assert_eq!(storage.observed(), K as usize);
        assert_eq!(spout.released(), K);
    }

    #[test]
    fn test_stop_rethrows_worker_panic() {
        let storage = MockStorage::panicking_at(3);
        let pipeline = IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            PipelineConfig {
                n_queues: 1,
                queue_capacity: 64,
                // Large enough that the producer never waits on the
                // dead worker for a slot.
                pool_size: 64,
                backoff: BackoffPolicy::LinearBackoff,
            },
        );
        pipeline.start().unwrap();

        let mut spout = pipeline.make_spout();
        for t in 0..10 {
            assert!(spout.write(Sample::new(1, t, 0.0)));
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.stop()));
        assert!(result.is_err());
    }

    #[test]
    fn test_spouts_distribute_over_queues() {
        let storage = MockStorage::new();
        let pipeline = IngestionPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            small_config(BackoffPolicy::LinearBackoff),
        );
        pipeline.start().unwrap();

        // More spouts than queues; every spout must stay writable.
        let mut spouts: Vec<_> = (0..10).map(|_| pipeline.make_spout()).collect();
        for (i, spout) in spouts.iter_mut().enumerate() {
            assert!(spout.write(Sample::new(i as u64, 0, 0.0)));
        }
        pipeline.stop().unwrap();
        assert_eq!(storage.observed(), 10);
    }
}
