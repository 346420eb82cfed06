//! Accelerator memory accounting
//!
//! Models a device allocator with a reuse cache: released bytes move
//! to a cached pool that is not available to new claims until
//! [`AcceleratorPool::empty_cache`] returns them. Workers call
//! empty_cache at the end of every operation so that colocated engines
//! see the memory they expect.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct PoolState {
    allocated: u64,
    cached: u64,
}

/// Byte-level accelerator memory pool shared by every engine in a
/// worker process
#[derive(Debug)]
pub struct AcceleratorPool {
    capacity: u64,
    state: Mutex<PoolState>,
    ledger: DashMap<String, u64>,
}

impl AcceleratorPool {
    /// Creates a pool with the given capacity in bytes
    pub fn new(capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity_bytes,
            state: Mutex::new(PoolState::default()),
            ledger: DashMap::new(),
        })
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently claimed
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Bytes released but still held by the allocator cache
    pub fn cached(&self) -> u64 {
        self.state.lock().cached
    }

    /// Bytes available to new claims
    pub fn available(&self) -> u64 {
        let state = self.state.lock();
        self.capacity - state.allocated - state.cached
    }

    /// Claims bytes under a label.
    ///
    /// Cached bytes do not satisfy claims; a claim that exceeds the
    /// free capacity fails even when the cache holds enough.
    pub fn claim(&self, label: &str, bytes: u64) -> Result<()> {
        {
            let mut state = self.state.lock();
            let free = self.capacity - state.allocated - state.cached;
            if bytes > free {
                return Err(Error::AllocationFailed {
                    label: label.to_string(),
                    requested: bytes,
                    available: free,
                });
            }
            state.allocated += bytes;
        }
        *self.ledger.entry(label.to_string()).or_insert(0) += bytes;
        debug!(label, bytes, allocated = self.allocated(), "Claimed accelerator memory");
        Ok(())
    }

    /// Releases bytes claimed under a label; the bytes move to the
    /// allocator cache
    pub fn release(&self, label: &str, bytes: u64) {
        {
            let mut state = self.state.lock();
            let freed = bytes.min(state.allocated);
            state.allocated -= freed;
            state.cached += freed;
        }
        if let Some(mut entry) = self.ledger.get_mut(label) {
            *entry = entry.saturating_sub(bytes);
        }
        self.ledger.remove_if(label, |_, v| *v == 0);
        debug!(label, bytes, cached = self.cached(), "Released accelerator memory");
    }

    /// Returns all cached bytes to the free pool
    pub fn empty_cache(&self) {
        let reclaimed = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.cached)
        };
        if reclaimed > 0 {
            debug!(reclaimed, "Emptied allocator cache");
        }
    }

    /// Snapshot of live claims by label, for diagnostics
    pub fn usage(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .ledger
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort();
        entries
    }
}

/// A claim on pool bytes that releases itself on drop.
///
/// Used for transient allocations such as batch activations; long
/// lived residency is managed by the offload controller instead.
#[derive(Debug)]
pub struct MemoryClaim {
    pool: Arc<AcceleratorPool>,
    label: String,
    bytes: u64,
}

impl MemoryClaim {
    /// Claims bytes from the pool, failing when capacity is exhausted
    pub fn new(pool: Arc<AcceleratorPool>, label: impl Into<String>, bytes: u64) -> Result<Self> {
        let label = label.into();
        pool.claim(&label, bytes)?;
        Ok(Self { pool, label, bytes })
    }

    /// Size of this claim in bytes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Label this claim was made under
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.pool.release(&self.label, self.bytes);
    }
}
