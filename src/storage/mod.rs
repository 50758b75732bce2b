//! Storage connection surface
//!
//! The pipeline worker writes through the [`Storage`] trait; queries
//! come back through [`Cursor`]. Implementations are selected at
//! construction and passed by handle. [`PageConnection`] is the
//! page-backed implementation; multi-page volume management sits above
//! this layer.

mod connection;
mod registry;

pub use connection::{PageConnection, PageStoreConfig};
pub use registry::SeriesRegistry;

use crate::{ParamId, Result, Sample, SearchQuery};
use serde::{Deserialize, Serialize};

/// Write/search capability set the pipeline worker calls into.
///
/// `write` is only ever called by the single worker thread;
/// `series_to_param_id` must additionally be safe for concurrent calls
/// from many spouts.
pub trait Storage: Send + Sync {
    /// Append one sample to storage
    fn write(&self, sample: &Sample) -> Result<()>;

    /// Run a single-series time-range query. The out-of-scope query
    /// parser turns its textual form into the [`SearchQuery`] plan.
    fn search(&self, query: SearchQuery) -> Result<Box<dyn Cursor + '_>>;

    /// Resolve a series name to its id, allocating one on first use
    fn series_to_param_id(&self, name: &[u8]) -> Result<ParamId>;

    /// Reverse-resolve an id into `buf`, returning the name length.
    /// Fails with [`crate::Error::Overflow`] when `buf` is too small.
    fn param_id_to_series(&self, id: ParamId, buf: &mut [u8]) -> Result<usize>;
}

/// Result stream of a [`Storage::search`] call
pub trait Cursor {
    /// Fill `buf` with up to `buf.len()` samples, returning how many
    /// were written. Zero with `is_done()` means exhaustion.
    fn read(&mut self, buf: &mut [Sample]) -> Result<usize>;

    /// Whether the stream is exhausted
    fn is_done(&self) -> bool;

    /// Error that terminated the stream, if any
    fn error(&self) -> Option<&crate::Error>;

    /// Release the cursor's resources; further reads fail
    fn close(&mut self);
}

/// Durability mode selected when a connection is opened. Controls the
/// storage-layer flush policy and is transparent to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Durability {
    /// Let the OS write back the mapping when it pleases
    #[default]
    MaxWriteSpeed,
    /// Flush the mapping after every write
    Durable,
}
