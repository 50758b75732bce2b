//! Bounded lock-free MPSC queue
//!
//! A fixed-capacity ring of slots, each guarded by a sequence number
//! (Vyukov scheme). Producers claim a position with a CAS on the tail
//! cursor, write the value, then publish it by bumping the slot
//! sequence with a release store; the consumer observes the sequence
//! with an acquire load before reading. A successful push therefore
//! happens-before the matching pop observes the value and anything it
//! transitively references.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer/single-consumer queue.
///
/// `pop` must only ever be called from one thread at a time; `push` is
/// safe from any number of threads.
pub struct BoundedQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    /// Next position producers will claim
    tail: CachePadded<AtomicUsize>,
    /// Next position the consumer will read
    head: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue with the given capacity, which must be a power of
    /// two of at least 2.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "queue capacity must be a power of two"
        );
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Non-blocking push. Returns the value back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[tail & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // The CAS gave this thread exclusive ownership
                        // of the slot until the sequence store below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if (sequence.wrapping_sub(tail) as isize) < 0 {
                // Slot still holds an undequeued value.
                return Err(value);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking pop. Single consumer only.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buffer[head & self.mask];
        let sequence = slot.sequence.load(Ordering::Acquire);

        if sequence == head.wrapping_add(1) {
            self.head.store(head.wrapping_add(1), Ordering::Relaxed);
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            // Hand the slot back to producers one lap ahead.
            slot.sequence
                .store(head.wrapping_add(self.mask + 1), Ordering::Release);
            Some(value)
        } else {
            None
        }
    }

    /// Advisory emptiness check, intended for drain verification once
    /// producers have ceased.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
