//! Execution scheduler
//!
//! A fixed pool of worker slots fronted by a bounded FIFO queue:
//! - admission is non-blocking: `workers + queue_depth` permits, refused
//!   requests get `ExecError::Overloaded` and nothing runs
//! - admitted requests wait for a slot in arrival order (tokio semaphores are fair)
//! - each admitted job runs on its own task and holds one slot end-to-end
//!
//! Cancelling the caller's token, or dropping the `submit` future, cancels
//! the job's token. A queued job is dropped right away; a running job is
//! expected to observe its token and wind down.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::ExecError;

/// Point-in-time load figures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

pub struct Scheduler {
    workers: usize,
    capacity: usize,
    admission: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    free_slots: Arc<Mutex<Vec<usize>>>,
    busy: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let capacity = workers + queue_depth;
        Self {
            workers,
            capacity,
            admission: Arc::new(Semaphore::new(capacity)),
            slots: Arc::new(Semaphore::new(workers)),
            free_slots: Arc::new(Mutex::new((0..workers).rev().collect())),
            busy: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.workers,
            busy: self.busy.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Run `job` on a worker slot and wait for its result
    ///
    /// `job` receives the slot index and a token that is cancelled when the
    /// caller cancels or stops waiting.
    pub async fn submit<F, Fut, T>(&self, cancel: &CancellationToken, job: F) -> Result<T, ExecError>
    where
        F: FnOnce(usize, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecError::Overloaded);
        }
        let admission = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| ExecError::Overloaded)?;

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let token = cancel.child_token();
        // Cancels the job if this future is dropped
        let _cancel_on_drop = token.clone().drop_guard();

        let permit = {
            let _queued = Counted::new(&self.queued);
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Queued request cancelled before start");
                    return Err(ExecError::Cancelled);
                }
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    permit.map_err(|_| ExecError::Overloaded)?
                }
            }
        };

        let lease = SlotLease::take(
            Arc::clone(&self.free_slots),
            Arc::clone(&self.busy),
            permit,
            admission,
        )?;
        let slot = lease.slot;
        let job_token = token.clone();

        let handle = tokio::spawn(async move {
            let _lease = lease;
            job(slot, job_token).await
        });

        match handle.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("Worker on slot {} panicked: {}", slot, message);
                Err(ExecError::WorkerPanicked(message))
            }
            Err(e) => Err(ExecError::WorkerPanicked(e.to_string())),
        }
    }

    /// Refuse new work and wait until everything admitted has finished
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let stats = self.stats();
        info!(
            "Scheduler draining ({} running, {} queued)",
            stats.busy, stats.queued
        );
        if let Ok(all) = self.admission.acquire_many(self.capacity as u32).await {
            all.forget();
        }
        self.admission.close();
        info!("Scheduler drained");
    }
}

/// Increments a gauge for as long as it lives
struct Counted<'a>(&'a AtomicUsize);

impl<'a> Counted<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for Counted<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A worker slot held by a running job; returned to the pool on drop
struct SlotLease {
    slot: usize,
    pool: Arc<Mutex<Vec<usize>>>,
    busy: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
    _admission: OwnedSemaphorePermit,
}

impl SlotLease {
    fn take(
        pool: Arc<Mutex<Vec<usize>>>,
        busy: Arc<AtomicUsize>,
        permit: OwnedSemaphorePermit,
        admission: OwnedSemaphorePermit,
    ) -> Result<Self, ExecError> {
        let slot = pool
            .lock()
            .map_err(|_| ExecError::WorkerPanicked("slot pool poisoned".to_string()))?
            .pop()
            .ok_or_else(|| ExecError::WorkerPanicked("no free slot behind permit".to_string()))?;
        busy.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            slot,
            pool,
            busy,
            _permit: permit,
            _admission: admission,
        })
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        // Return the index before the permit is released
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(self.slot);
        }
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_overload_with_zero_queue() {
        const N: usize = 3;
        let scheduler = Arc::new(Scheduler::new(N, 0));

        let mut handles = Vec::new();
        for _ in 0..N + 5 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, |_, _| async {
                        let start = Instant::now();
                        sleep(Duration::from_millis(300)).await;
                        (start, Instant::now())
                    })
                    .await
            }));
        }

        let mut spans = Vec::new();
        let mut overloaded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(span) => spans.push(span),
                Err(ExecError::Overloaded) => overloaded += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(overloaded, 5);
        assert_eq!(spans.len(), N);

        // All admitted executions overlap
        let latest_start = spans.iter().map(|s| s.0).max().unwrap();
        let earliest_end = spans.iter().map(|s| s.1).min().unwrap();
        assert!(latest_start < earliest_end);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let scheduler = Arc::new(Scheduler::new(1, 10));
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, |_, _| sleep(Duration::from_millis(100)))
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, move |_, _| async move {
                        order.lock().unwrap().push(i);
                    })
                    .await
            }));
            sleep(Duration::from_millis(10)).await;
        }

        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queued_cancel_is_immediate() {
        let scheduler = Arc::new(Scheduler::new(1, 1));

        let blocker = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, |_, _| sleep(Duration::from_millis(500)))
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let flag = Arc::clone(&ran);
        let result = scheduler
            .submit(&cancel, move |_, _| async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        assert_eq!(result, Err(ExecError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().queued, 0);

        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_running_job_sees_cancellation() {
        let scheduler = Scheduler::new(1, 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = scheduler
            .submit(&cancel, |_, token| async move {
                tokio::select! {
                    _ = token.cancelled() => "stopped",
                    _ = sleep(Duration::from_secs(10)) => "finished",
                }
            })
            .await;

        assert_eq!(result, Ok("stopped"));
    }

    #[tokio::test]
    async fn test_dropping_submit_cancels_job() {
        let scheduler = Arc::new(Scheduler::new(1, 0));
        let observed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&observed);
        let submit = {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, move |_, token| async move {
                        token.cancelled().await;
                        flag.store(true, Ordering::SeqCst);
                    })
                    .await
            }
        };
        let _ = tokio::time::timeout(Duration::from_millis(50), submit).await;

        sleep(Duration::from_millis(50)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_panic_reported_and_slot_returned() {
        let scheduler = Scheduler::new(1, 0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = scheduler
            .submit(&cancel, |_, _| async { panic!("boom") })
            .await;
        assert_eq!(result, Err(ExecError::WorkerPanicked("boom".to_string())));

        let slot = scheduler.submit(&cancel, |slot, _| async move { slot }).await;
        assert_eq!(slot, Ok(0));
    }

    #[tokio::test]
    async fn test_slots_are_exclusive() {
        let scheduler = Arc::new(Scheduler::new(2, 8));
        let in_use = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let scheduler = Arc::clone(&scheduler);
            let in_use = Arc::clone(&in_use);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, move |slot, _| async move {
                        assert!(slot < 2);
                        assert!(in_use.lock().unwrap().insert(slot), "slot {} shared", slot);
                        sleep(Duration::from_millis(20)).await;
                        in_use.lock().unwrap().remove(&slot);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses() {
        let scheduler = Arc::new(Scheduler::new(1, 1));
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                scheduler
                    .submit(&cancel, move |_, _| async move {
                        sleep(Duration::from_millis(100)).await;
                        flag.store(true, Ordering::SeqCst);
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        scheduler.shutdown().await;
        assert!(done.load(Ordering::SeqCst));

        let cancel = CancellationToken::new();
        let refused = scheduler.submit(&cancel, |_, _| async {}).await;
        assert_eq!(refused, Err(ExecError::Overloaded));
        running.await.unwrap().unwrap();
    }
}
