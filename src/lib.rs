//! EmberDB Core - Time-Series Ingestion Engine
//!
//! The ingestion core of a time-series database: many concurrent writers
//! feed timestamped numeric samples through a bounded, lock-free pipeline
//! into a memory-mapped, append-only page store optimized for range
//! queries over (series, time) pairs.
//!
//! # Architecture
//!
//! - **Pipeline**: multi-producer/single-consumer fan-in. Each producer
//!   owns a [`pipeline::Spout`] with a fixed slot pool; one worker thread
//!   drains all queues round-robin and writes into storage.
//! - **Page**: fixed-size byte region holding a header, a growing offset
//!   index, and entries packed from the tail, summarized by a 2-D
//!   bounding box over (series id, timestamp).
//! - **Search**: bounding-box rejection, then interpolation search over
//!   the sorted index prefix with a binary-search fallback, merged with a
//!   linear scan of the unsorted tail.

pub mod page;
pub mod pipeline;
pub mod storage;

mod error;
mod types;

pub use error::{Error, Result};
pub use types::*;

/// EmberDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Number of ingestion queues per pipeline
    pub const N_QUEUES: usize = 8;

    /// Capacity of each ingestion queue (must be a power of two)
    pub const QUEUE_CAPACITY: usize = 4096;

    /// Number of pre-allocated sample slots per spout
    pub const POOL_SIZE: usize = 512;

    /// Consecutive empty pops before the worker starts sleeping
    pub const IDLE_THRESHOLD: u32 = 0x10000;

    /// Interval between worker health checks while draining (15s)
    pub const STOP_CHECK_INTERVAL_MS: u64 = 15_000;

    /// Default page size (8MB)
    pub const DEFAULT_PAGE_SIZE: u64 = 8 * 1024 * 1024;
}
