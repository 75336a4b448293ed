//! Write-serialization queue for the single-writer analytical store
//!
//! One FIFO gate shared by every job. Write stages hold a `WriteLease` for
//! as long as they run; dropping the lease (on success, error, panic or task
//! abort) releases the gate. Read-only stages never touch it.

use crate::core::error::{EngineError, Result};
use crate::core::job::JobId;
use crate::execution::cancel::CancellationToken;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Who currently holds the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteHolder {
    pub job_id: JobId,
    pub stage: String,
}

#[derive(Debug)]
struct Shared {
    /// Tokio semaphores hand out permits in FIFO order
    gate: Arc<Semaphore>,
    waiters: AtomicUsize,
    holder: Mutex<Option<WriteHolder>>,
}

impl Shared {
    fn set_holder(&self, holder: Option<WriteHolder>) {
        match self.holder.lock() {
            Ok(mut current) => *current = holder,
            Err(poisoned) => *poisoned.into_inner() = holder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteQueue {
    shared: Arc<Shared>,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                gate: Arc::new(Semaphore::new(1)),
                waiters: AtomicUsize::new(0),
                holder: Mutex::new(None),
            }),
        }
    }

    /// Wait for the gate, giving up after `timeout`
    pub async fn acquire(&self, job_id: JobId, stage: &str, timeout: Duration) -> Result<WriteLease> {
        self.acquire_cancellable(job_id, stage, timeout, &CancellationToken::new())
            .await
    }

    /// Like `acquire`, but also stops waiting when `cancel` fires
    pub async fn acquire_cancellable(
        &self,
        job_id: JobId,
        stage: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WriteLease> {
        let started = Instant::now();
        let _waiting = WaiterGuard::enter(&self.shared);
        debug!(job_id = %job_id, stage, "Waiting for write lock ({} waiting)", self.depth());

        let permit = tokio::select! {
            permit = tokio::time::timeout(timeout, self.shared.gate.clone().acquire_owned()) => permit,
            _ = cancel.cancelled() => {
                return Err(EngineError::CancellationRequested(job_id));
            }
        };

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(EngineError::Storage(anyhow::anyhow!("write queue is closed")));
            }
            Err(_) => {
                warn!(job_id = %job_id, stage, "Write lock not acquired within {}s", timeout.as_secs_f64());
                return Err(EngineError::WriteLockTimeout {
                    waited: started.elapsed(),
                });
            }
        };

        let holder = WriteHolder {
            job_id,
            stage: stage.to_string(),
        };
        self.shared.set_holder(Some(holder.clone()));
        debug!(job_id = %job_id, stage, "Write lock acquired after {:?}", started.elapsed());

        Ok(WriteLease {
            shared: self.shared.clone(),
            holder,
            acquired_at: Instant::now(),
            _permit: permit,
        })
    }

    /// Stages currently waiting for the gate
    pub fn depth(&self) -> usize {
        self.shared.waiters.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.shared.gate.available_permits() == 0
    }

    pub fn holder(&self) -> Option<WriteHolder> {
        match self.shared.holder.lock() {
            Ok(holder) => holder.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Counts a waiter for as long as it is waiting, however the wait ends
struct WaiterGuard<'a> {
    shared: &'a Shared,
}

impl<'a> WaiterGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let depth = shared.waiters.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_write_queue_depth(depth);
        Self { shared }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let depth = self.shared.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::set_write_queue_depth(depth);
    }
}

/// Exclusive access to the shared store; released on drop
#[derive(Debug)]
pub struct WriteLease {
    shared: Arc<Shared>,
    holder: WriteHolder,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl WriteLease {
    pub fn holder(&self) -> &WriteHolder {
        &self.holder
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        self.shared.set_holder(None);
        crate::metrics::record_write_lock_hold(held);
        debug!(
            job_id = %self.holder.job_id,
            stage = %self.holder.stage,
            "Write lock released after {:?}",
            held
        );
        // The permit field drops after this, reopening the gate
    }
}
