//! Worker pool bounding concurrent task execution.
//!
//! The `WorkerPool` hands out at most `capacity` slots at a time. A slot is
//! held for the whole life of a task dispatch, including retry backoff, and
//! is released when dropped. The pool also tracks how many slots are in use
//! and the highest count ever observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A bounded pool of worker slots.
///
/// # Example
///
/// ```
/// use conductor::orchestration::WorkerPool;
///
/// let pool = WorkerPool::new(2);
/// let a = pool.try_acquire().unwrap();
/// let _b = pool.try_acquire().unwrap();
/// assert!(pool.try_acquire().is_none());
///
/// drop(a);
/// assert_eq!(pool.active_count(), 1);
/// assert_eq!(pool.peak_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// A claimed worker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Create a pool with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    fn claim(&self, permit: OwnedSemaphorePermit) -> WorkerSlot {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        WorkerSlot {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Claim a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.claim(permit))
    }

    /// Wait for a free slot.
    ///
    /// Returns `None` only if the pool has been closed.
    pub async fn acquire(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.claim(permit))
    }

    /// Get the number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at the same time.
    pub fn peak_count(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Check if the pool has a free slot.
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
