//! Bounded pool of workflow slots.
//!
//! The [`WorkerPool`] caps how many runs talk to the container runtime at
//! once. A run holds its slot from the moment it starts pulling until its
//! workflow returns; runs beyond the pool size queue until a slot frees.

use tokio::sync::{Semaphore, SemaphorePermit};

/// A fixed number of concurrent workflow slots.
///
/// # Example
///
/// ```
/// use lambda_harness::orchestrator::WorkerPool;
///
/// # tokio_test::block_on(async {
/// let pool = WorkerPool::new(2);
/// let slot = pool.acquire().await.unwrap();
/// assert_eq!(pool.available(), 1);
/// drop(slot);
/// assert_eq!(pool.available(), 2);
/// # });
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    slots: Semaphore,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool with `size` slots. Minimum is 1 (values below 1 are
    /// clamped).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Semaphore::new(size),
            size,
        }
    }

    /// Waits for a free slot. The slot is released when the permit drops.
    ///
    /// Returns `None` only if the underlying semaphore is closed, which a
    /// pool never does.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.slots.acquire().await.ok()
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
