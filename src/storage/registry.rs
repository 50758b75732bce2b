//! Series name registry
//!
//! Maps external series names to opaque [`ParamId`]s and back. Safe for
//! concurrent resolution from many spouts. Name syntax and persistence
//! belong to the layer above; this is the in-memory map.

use crate::{Error, ParamId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct RegistryInner {
    forward: HashMap<Vec<u8>, ParamId>,
    reverse: HashMap<ParamId, Vec<u8>>,
    next_id: ParamId,
}

/// Bidirectional name ⇄ id map with id allocation
#[derive(Default)]
pub struct SeriesRegistry {
    inner: RwLock<RegistryInner>,
}

impl SeriesRegistry {
    /// Create an empty registry; ids are allocated from 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a name, allocating a fresh id on first use
    pub fn get_or_create(&self, name: &[u8]) -> Result<ParamId> {
        if name.is_empty() {
            return Err(Error::BadArg("empty series name".into()));
        }
        if let Some(&id) = self.inner.read().forward.get(name) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        // Another writer may have raced us here.
        if let Some(&id) = inner.forward.get(name) {
            return Ok(id);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.forward.insert(name.to_vec(), id);
        inner.reverse.insert(id, name.to_vec());
        Ok(id)
    }

    /// Look a name up without allocating
    pub fn lookup(&self, name: &[u8]) -> Option<ParamId> {
        self.inner.read().forward.get(name).copied()
    }

    /// Copy the name of `id` into `buf`, returning the name length.
    /// Fails with [`Error::Overflow`] when `buf` cannot hold it.
    pub fn reverse_into(&self, id: ParamId, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.read();
        let name = inner
            .reverse
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("param id {}", id)))?;
        if buf.len() < name.len() {
            return Err(Error::Overflow);
        }
        buf[..name.len()].copy_from_slice(name);
        Ok(name.len())
    }

    /// Number of registered series
    pub fn len(&self) -> usize {
        self.inner.read().forward.len()
    }

    /// Whether no series are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
