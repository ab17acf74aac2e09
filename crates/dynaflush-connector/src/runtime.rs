//! Worker pool that drives flush controllers.
//!
//! `WorkerPool` spawns a fixed number of tokio tasks. Each task owns its own
//! `FlushController`, so no batch state is shared between workers; only the
//! executor handle is. Delivery units arrive over a bounded channel whose
//! receiver is shared behind a mutex, so whichever worker is idle takes the
//! next unit.
//!
//! A unit whose flush fails with a transport error is redelivered to the
//! same controller after a backoff. Any other failure, or running out of
//! retries, gives the unit up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dynaflush_core::{DeliveryUnit, FlushController, FlushError, FlushOutcome, Result};
use tokio::io::AsyncBufRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::retry::RetryPolicy;
use crate::source::NdjsonSource;

/// Snapshot of pool-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Units flushed successfully (possibly after redelivery).
    pub units_ok: u64,
    /// Flush attempts that returned a failure.
    pub units_failed: u64,
    /// Units given up on.
    pub units_abandoned: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    units_ok: AtomicU64,
    units_failed: AtomicU64,
    units_abandoned: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            units_ok: self.units_ok.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            units_abandoned: self.units_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// A fixed set of flush workers fed from one channel.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::spawn(controller, 2, RetryPolicy::default(), 64);
/// pool.submit(unit).await?;
/// let stats = pool.shutdown().await;
/// ```
pub struct WorkerPool {
    tx: mpsc::Sender<DeliveryUnit>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one), each with a clone of `controller`.
    pub fn spawn(
        controller: FlushController,
        workers: usize,
        retry: RetryPolicy,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<DeliveryUnit>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let controller = controller.clone();
                let retry = retry.clone();
                let counters = counters.clone();

                tokio::spawn(async move {
                    tracing::debug!(worker, table = controller.table(), "flush worker started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(unit) = next else { break };
                        deliver(worker, &controller, &retry, &counters, &unit).await;
                    }
                    tracing::debug!(worker, "flush worker stopped");
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
            counters,
        }
    }

    /// Queue a unit, waiting for channel capacity.
    pub async fn submit(&self, unit: DeliveryUnit) -> Result<()> {
        self.tx
            .send(unit)
            .await
            .map_err(|e| {
                FlushError::Runtime(format!("worker pool closed, unit {} dropped", e.0.id))
            })
    }

    /// Number of worker tasks.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Close the channel, let workers drain what is queued, and join them.
    pub async fn shutdown(self) -> PoolStats {
        let WorkerPool {
            tx,
            workers,
            counters,
        } = self;
        drop(tx);

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "flush worker panicked");
            }
        }

        let stats = counters.snapshot();
        tracing::info!(
            units_ok = stats.units_ok,
            units_failed = stats.units_failed,
            units_abandoned = stats.units_abandoned,
            "worker pool stopped"
        );
        stats
    }
}

/// Feed every unit `source` yields into `pool`. Returns the number of units
/// submitted.
pub async fn pump<R>(source: &mut NdjsonSource<R>, pool: &WorkerPool) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut submitted = 0;
    while let Some(unit) = source.next_unit().await? {
        pool.submit(unit).await?;
        submitted += 1;
    }
    Ok(submitted)
}

async fn deliver(
    worker: usize,
    controller: &FlushController,
    retry: &RetryPolicy,
    counters: &PoolCounters,
    unit: &DeliveryUnit,
) {
    let mut attempt = 0;

    loop {
        let e = match controller.flush(unit).await {
            FlushOutcome::Success(_) => {
                counters.units_ok.fetch_add(1, Ordering::Relaxed);
                if attempt > 0 {
                    tracing::info!(
                        worker,
                        unit = unit.id,
                        attempt = attempt + 1,
                        "unit flushed after redelivery"
                    );
                }
                return;
            }
            FlushOutcome::Failure(e) => e,
        };
        counters.units_failed.fetch_add(1, Ordering::Relaxed);

        if !e.is_retryable() {
            counters.units_abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                worker,
                unit = unit.id,
                records = unit.len(),
                error = %e,
                "unit failed with a non-retryable error, giving up"
            );
            return;
        }

        if attempt >= retry.max_retries {
            counters.units_abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                worker,
                unit = unit.id,
                records = unit.len(),
                max_retries = retry.max_retries,
                error = %e,
                "retry limit reached, giving up on unit"
            );
            return;
        }

        let backoff = retry.backoff(attempt);
        tracing::warn!(
            worker,
            unit = unit.id,
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            error = %e,
            "redelivering unit"
        );
        sleep(backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use dynaflush_core::{
        Event, FailureKind, InMemoryExecutor, KeySchema, Record, Scalar, SinkConfig,
    };
    use serde_json::json;

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    fn setup() -> (FlushController, Arc<InMemoryExecutor>) {
        let schema = KeySchema::simple("id", Scalar::String);
        let executor = Arc::new(InMemoryExecutor::new("logs", schema.clone()));
        let controller =
            FlushController::new(&SinkConfig::new("logs"), schema, executor.clone()).unwrap();
        (controller, executor)
    }

    fn unit(id: u64, n: usize) -> DeliveryUnit {
        let events = (0..n)
            .map(|i| {
                let record = Record::try_from(json!({"id": format!("u{}-{}", id, i)})).unwrap();
                Event::new(Utc::now(), record)
            })
            .collect();
        DeliveryUnit::new(id, events)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_spawn_and_shutdown_empty() {
        let (controller, _) = setup();
        let pool = WorkerPool::spawn(controller, 3, fast_retry(1), 4);
        assert_eq!(pool.workers(), 3);
        assert_eq!(pool.shutdown().await, PoolStats::default());
    }

    #[tokio::test]
    async fn test_zero_workers_clamped_to_one() {
        let (controller, _) = setup();
        let pool = WorkerPool::spawn(controller, 0, fast_retry(1), 4);
        assert_eq!(pool.workers(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (controller, executor) = setup();
        let pool = WorkerPool::spawn(controller, 2, fast_retry(1), 16);
        for id in 0..8 {
            pool.submit(unit(id, 10)).await.unwrap();
        }

        let stats = pool.shutdown().await;
        assert_eq!(stats.units_ok, 8);
        assert_eq!(executor.len().await, 80);
    }

    // ---------------------------------------------------------------
    // Redelivery
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_transport_failure_is_redelivered() {
        let (controller, executor) = setup();
        executor.fail_next(FailureKind::Transport).await;
        let pool = WorkerPool::spawn(controller, 1, fast_retry(3), 4);
        pool.submit(unit(1, 30)).await.unwrap();

        let stats = pool.shutdown().await;
        assert_eq!(stats.units_ok, 1);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.units_abandoned, 0);
        assert_eq!(executor.len().await, 30);
        assert_eq!(executor.reconnects().await, 1);
    }

    #[tokio::test]
    async fn test_retry_limit_abandons_unit() {
        let (controller, executor) = setup();
        for _ in 0..3 {
            executor.fail_next(FailureKind::Transport).await;
        }
        let pool = WorkerPool::spawn(controller, 1, fast_retry(2), 4);
        pool.submit(unit(1, 5)).await.unwrap();

        let stats = pool.shutdown().await;
        assert_eq!(stats.units_ok, 0);
        assert_eq!(stats.units_failed, 3);
        assert_eq!(stats.units_abandoned, 1);
        assert!(executor.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_not_redelivered() {
        let schema = KeySchema::simple("id", Scalar::String);
        let executor = Arc::new(InMemoryExecutor::new("logs", schema.clone()));
        let mut config = SinkConfig::new("logs");
        config.validation_policy = dynaflush_core::ValidationPolicy::FailUnit;
        let controller = FlushController::new(&config, schema, executor.clone()).unwrap();
        executor.fail_next(FailureKind::Validation).await;

        let pool = WorkerPool::spawn(controller, 1, fast_retry(5), 4);
        pool.submit(unit(1, 5)).await.unwrap();

        let stats = pool.shutdown().await;
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.units_abandoned, 1);
        assert_eq!(executor.calls().await, 1);
    }
}
