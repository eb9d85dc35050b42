use crate::dispatch::BatchSubmitter;
use async_trait::async_trait;
use common::domain::{
    AlertNotifier, BatchKey, Detection, DetectionStore, DomainResult, InferenceOutcome,
    InferenceRunner, SensorBatch,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Reports this worker's load for auction bids: lower = more capacity.
#[cfg_attr(test, mockall::automock)]
pub trait LoadProbe: Send + Sync {
    fn score(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct ExecutionPoolConfig {
    pub workers: usize,
    pub task_timeout: Duration,
}

/// Runs inference for finalized batches on isolated blocking threads.
///
/// Concurrency is bounded by a semaphore; excess submissions queue behind
/// it. Each run is contained by its task boundary, so a panic inside model
/// code cannot corrupt the queue or auction state living in this process.
/// The only thing the pool does with an outcome is forward it to the
/// persistence and alerting collaborators.
#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    semaphore: Semaphore,
    runner: Arc<dyn InferenceRunner>,
    store: Arc<dyn DetectionStore>,
    notifier: Arc<dyn AlertNotifier>,
    task_timeout: Duration,
    in_flight: AtomicUsize,
}

impl ExecutionPool {
    pub fn new(
        runner: Arc<dyn InferenceRunner>,
        store: Arc<dyn DetectionStore>,
        notifier: Arc<dyn AlertNotifier>,
        config: ExecutionPoolConfig,
    ) -> Self {
        info!(
            workers = config.workers,
            task_timeout_secs = config.task_timeout.as_secs(),
            "Initializing execution pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Semaphore::new(config.workers),
                runner,
                store,
                notifier,
                task_timeout: config.task_timeout,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Submit a batch for execution. Returns immediately; completion,
    /// failure and collaborator forwarding all happen on the spawned task.
    pub fn submit(&self, batch: SensorBatch) {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            inner.execute(batch).await;
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Submissions currently queued or running.
    pub fn load(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Create a LoadProbe trait object reporting this pool's occupancy.
    pub fn load_probe(&self) -> Arc<dyn LoadProbe> {
        Arc::new(PoolLoadProbe {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl PoolInner {
    async fn execute(&self, batch: SensorBatch) {
        let key = batch.key();
        let batch_size = batch.len();
        let dispatched_at = batch.dispatched_at;

        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(key = %key, "execution pool closed, dropping batch");
                return;
            }
        };

        debug!(key = %key, batch_size, "executing batch");
        let runner = Arc::clone(&self.runner);
        let mut join = tokio::task::spawn_blocking(move || runner.run_batch(&batch));

        let joined = match tokio::time::timeout(self.task_timeout, &mut join).await {
            Ok(joined) => joined,
            Err(_) => {
                // The blocking thread cannot be interrupted; the permit is
                // released only once it actually returns.
                error!(
                    key = %key,
                    timeout_secs = self.task_timeout.as_secs(),
                    "inference task exceeded its deadline, waiting for the worker thread"
                );
                join.await
            }
        };
        drop(permit);

        match joined {
            Ok(Ok(outcome)) => self.forward(&key, dispatched_at, outcome).await,
            Ok(Err(e)) => error!(key = %key, error = %e, "inference run failed"),
            Err(e) if e.is_panic() => {
                error!(key = %key, "inference task panicked, shared state unaffected");
            }
            Err(e) => error!(key = %key, error = %e, "inference task aborted"),
        }
    }

    async fn forward(
        &self,
        key: &BatchKey,
        occurred_at: chrono::DateTime<chrono::Utc>,
        outcome: InferenceOutcome,
    ) {
        let detection = Detection {
            entity_id: key.entity_id.clone(),
            topic: key.topic,
            occurred_at,
            result: outcome.result,
        };
        if let Err(e) = self.store.store_detection(&detection).await {
            error!(key = %key, error = %e, "failed to store detection result");
        }
        if let Some(message) = outcome.alert {
            if let Err(e) = self.notifier.notify(&key.entity_id, &message).await {
                error!(key = %key, error = %e, "failed to deliver alert");
            }
        }
    }
}

struct PoolLoadProbe {
    inner: Arc<PoolInner>,
}

impl LoadProbe for PoolLoadProbe {
    fn score(&self) -> f64 {
        self.inner.in_flight.load(Ordering::SeqCst) as f64
    }
}

/// BatchSubmitter that executes batches on the local pool.
pub struct PoolSubmitter {
    pool: ExecutionPool,
}

impl PoolSubmitter {
    pub fn new(pool: ExecutionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSubmitter for PoolSubmitter {
    async fn submit(&self, batch: SensorBatch) -> DomainResult<()> {
        self.pool.submit(batch);
        Ok(())
    }
}
