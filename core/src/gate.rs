//! Bounded in-flight counter with a FIFO queue.
//!
//! The single bound on total in-flight work: up to `max_concurrent` tasks
//! run at once, up to `queue_size` more wait in FIFO order, and anything
//! beyond that fast-fails with the dedicated queue-full error (translated
//! upstream to ServerBusy).

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Instant;

use metrics::histogram;
use tokio::sync::Semaphore;

use crate::error::ConduitErr;
use crate::error::Result;

const QUEUE_WAIT_METRIC: &str = "conduit_gate_wait_seconds";

pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    queue_size: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize, queue_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queued: AtomicUsize::new(0),
            queue_size,
        }
    }

    /// Run `task` once a slot is available. Queueing is FIFO (tokio
    /// semaphores are fair); a full queue is an immediate error.
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let queued_at = Instant::now();
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.queue_size {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(ConduitErr::QueueFull);
                }
                let acquired = self.permits.clone().acquire_owned().await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(ConduitErr::Internal(
                            "concurrency gate is closed".to_string(),
                        ));
                    }
                }
            }
        };
        histogram!(QUEUE_WAIT_METRIC).record(queued_at.elapsed().as_secs_f64());

        let output = task.await;
        drop(permit);
        Ok(output)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_tasks_below_the_limit_immediately() {
        let gate = ConcurrencyGate::new(2, 2);
        let result = gate.run(async { 41 + 1 }).await.expect("must run");
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn queue_overflow_fast_fails_with_queue_full() {
        let gate = Arc::new(ConcurrencyGate::new(1, 1));

        // Occupy the single slot.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let running = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(async {
                    let _ = release_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the single queue slot.
        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.run(async { 7 }).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.queued(), 1);

        // Third submission overflows.
        let err = gate.run(async { 0 }).await.expect_err("queue must be full");
        assert!(matches!(err, ConduitErr::QueueFull));
        assert_eq!(err.code(), -32000);

        let _ = release_tx.send(());
        running.await.expect("join").expect("running task");
        assert_eq!(queued.await.expect("join").expect("queued task"), 7);
    }

    #[tokio::test]
    async fn dequeue_order_is_fifo() {
        let gate = Arc::new(ConcurrencyGate::new(1, 10));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(async {
                    let _ = release_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for index in 0..3 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.run(async move {
                    order.lock().await.push(index);
                })
                .await
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = release_tx.send(());
        blocker.await.expect("join").expect("blocker");
        for handle in handles {
            handle.await.expect("join").expect("queued task");
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
