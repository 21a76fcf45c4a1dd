use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

/// Backpressure: no memory permit became free in time. The job is requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no memory permit free within {0:?}")]
pub struct QuotaExceeded(pub Duration);

/// Counting semaphore over the worker share of the memory budget. Each
/// permit stands for one chunk's worth of resident voxelization state.
pub struct MemoryQuota {
    release_tx: Sender<()>,
    acquire_rx: Receiver<()>,
    permits: usize,
}

impl MemoryQuota {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        let (tx, rx) = bounded(permits);
        for _ in 0..permits {
            let _ = tx.send(());
        }
        Self {
            release_tx: tx,
            acquire_rx: rx,
            permits,
        }
    }

    /// Permits for `worker_budget` bytes at `chunk_footprint` bytes each,
    /// never fewer than one.
    pub fn for_budget(worker_budget: usize, chunk_footprint: usize) -> Self {
        Self::new(worker_budget / chunk_footprint.max(1))
    }

    #[inline]
    pub fn permits(&self) -> usize {
        self.permits
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.acquire_rx.len()
    }

    /// Waits up to `timeout` for a permit; it returns to the pool on drop.
    pub fn acquire(&self, timeout: Duration) -> Result<QuotaPermit<'_>, QuotaExceeded> {
        self.acquire_rx
            .recv_timeout(timeout)
            .map(|()| QuotaPermit { quota: self })
            .map_err(|_| QuotaExceeded(timeout))
    }
}

pub struct QuotaPermit<'q> {
    quota: &'q MemoryQuota,
}

impl Drop for QuotaPermit<'_> {
    fn drop(&mut self) {
        let _ = self.quota.release_tx.send(());
    }
}
