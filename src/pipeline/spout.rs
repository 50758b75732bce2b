//! Producer handle for the ingestion pipeline
//!
//! Each spout is bound to exactly one queue and owns a fixed pool of
//! sample slots. Slots are recycled through a pair of monotonic
//! counters: `created` counts slots the spout has handed out (advanced
//! only by the owning producer thread), `released` counts slots the
//! worker has acknowledged. A slot is free iff
//! `created - released < pool size`, so the free-space check and the
//! claim are a single decision of the one thread that can make it.

use super::queue::BoundedQueue;
use crate::storage::Storage;
use crate::{Error, ParamId, Result, Sample};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Producer behaviour when the slot pool is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Yield the scheduling quantum and retry indefinitely
    #[default]
    LinearBackoff,
    /// Sleep 1ms, then drop the sample and give up the write
    Throttle,
}

/// Callback invoked by the worker when a storage write fails. Receives
/// the error and the release counter value after the failed sample was
/// acknowledged. Must be non-blocking and reentrancy-safe.
pub type ErrorCallback = Arc<dyn Fn(&Error, u64) + Send + Sync>;

struct SampleSlot {
    sample: UnsafeCell<Sample>,
}

/// State shared between a spout and the worker: the slot pool, the
/// release counter and the error callback. Queue items carry an `Arc`
/// of this plus a slot index, never ownership of the slot itself.
pub(crate) struct SpoutShared {
    slots: Box<[SampleSlot]>,
    released: AtomicU64,
    on_error: RwLock<Option<ErrorCallback>>,
}

// Slot access follows the created/released protocol: a slot is touched
// either by its producer (free state) or by the worker (in flight),
// never both. The queue push/release pair is the handoff.
unsafe impl Sync for SpoutShared {}

impl SpoutShared {
    fn new(pool_size: usize) -> Self {
        let slots = (0..pool_size)
            .map(|_| SampleSlot {
                sample: UnsafeCell::new(Sample::new(0, 0, 0.0)),
            })
            .collect();
        Self {
            slots,
            released: AtomicU64::new(0),
            on_error: RwLock::new(None),
        }
    }

    pub(crate) fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Read the in-flight sample at `index`. Caller must be the worker
    /// that popped the slot's envelope.
    pub(crate) fn read_slot(&self, index: u32) -> Sample {
        unsafe { *self.slots[index as usize].sample.get() }
    }

    /// Acknowledge one slot; the release store makes the slot reusable
    /// by the producer. Returns the counter value after the increment.
    pub(crate) fn release_one(&self) -> u64 {
        self.released.fetch_add(1, Ordering::Release) + 1
    }

    pub(crate) fn notify_error(&self, error: &Error, released: u64) {
        let callback = self.on_error.read().clone();
        if let Some(callback) = callback {
            callback(error, released);
        }
    }
}

/// One queued unit of work: a published slot, or the poison pill the
/// pipeline pushes at shutdown.
pub(crate) enum Envelope {
    Sample { shared: Arc<SpoutShared>, slot: u32 },
    Poison,
}

/// Producer handle funneling samples from one writer thread into one
/// pipeline queue.
pub struct Spout {
    shared: Arc<SpoutShared>,
    queue: Arc<BoundedQueue<Envelope>>,
    storage: Arc<dyn Storage>,
    backoff: BackoffPolicy,
    pool_size: u64,
    created: u64,
}

impl Spout {
    pub(crate) fn new(
        queue: Arc<BoundedQueue<Envelope>>,
        backoff: BackoffPolicy,
        pool_size: usize,
        storage: Arc<dyn Storage>,
    ) -> Self {
        assert!(pool_size > 0, "spout pool must hold at least one slot");
        Self {
            shared: Arc::new(SpoutShared::new(pool_size)),
            queue,
            storage,
            backoff,
            pool_size: pool_size as u64,
            created: 0,
        }
    }

    /// Register the error callback invoked by the worker on failed
    /// storage writes.
    pub fn set_error_cb(&self, callback: ErrorCallback) {
        *self.shared.on_error.write() = Some(callback);
    }

    /// Slots this spout has ever handed out
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Slots the worker has acknowledged
    pub fn released(&self) -> u64 {
        self.shared.released()
    }

    /// Slots currently in flight, never exceeding the pool size
    pub fn in_flight(&self) -> u64 {
        self.created - self.released()
    }

    /// Submit a sample to the pipeline.
    ///
    /// Returns `true` once the sample is enqueued: it will eventually be
    /// written or reported via the error callback. Under
    /// [`BackoffPolicy::Throttle`] a saturated pool drops the sample
    /// after a 1ms sleep and `write` returns `false`.
    pub fn write(&mut self, sample: Sample) -> bool {
        let index = loop {
            match self.claim_slot() {
                Some(index) => break index,
                None => match self.backoff {
                    BackoffPolicy::LinearBackoff => thread::yield_now(),
                    BackoffPolicy::Throttle => {
                        thread::sleep(Duration::from_millis(1));
                        return false;
                    }
                },
            }
        };

        // Exclusive access until the worker releases past this slot
        // again; the queue push publishes the write.
        unsafe { *self.shared.slots[index as usize].sample.get() = sample };
        self.created += 1;

        let mut envelope = Envelope::Sample {
            shared: Arc::clone(&self.shared),
            slot: index,
        };
        // No drop path once a slot is claimed.
        loop {
            match self.queue.push(envelope) {
                Ok(()) => return true,
                Err(back) => {
                    envelope = back;
                    thread::yield_now();
                }
            }
        }
    }

    /// Resolve a series name through the storage connection. Safe to
    /// call from many spouts concurrently.
    pub fn series_to_param_id(&self, name: &[u8]) -> Result<ParamId> {
        self.storage.series_to_param_id(name)
    }

    fn claim_slot(&self) -> Option<u32> {
        let released = self.shared.released.load(Ordering::Acquire);
        if self.created - released < self.pool_size {
            Some((self.created % self.pool_size) as u32)
        } else {
            None
        }
    }
}
