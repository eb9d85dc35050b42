use crate::batch_queue::WindowedBatchQueue;
use async_trait::async_trait;
use chrono::Utc;
use common::domain::{DomainResult, SensorBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where finalized batches go: straight to the execution pool in standalone
/// mode, or out to the job-announcement channel in distributed mode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    async fn submit(&self, batch: SensorBatch) -> DomainResult<()>;
}

/// Periodic loop that flushes ready batch windows.
///
/// Single-flight: ticks never overlap. Submission is fire-and-forget; the
/// loop never waits for a batch to finish executing, so a slow inference
/// run for one entity cannot delay dispatch for the others. A failed
/// submission for one key is logged and skipped.
pub struct DispatchLoop {
    queue: Arc<WindowedBatchQueue>,
    submitter: Arc<dyn BatchSubmitter>,
    period: Duration,
}

impl DispatchLoop {
    pub fn new(
        queue: Arc<WindowedBatchQueue>,
        submitter: Arc<dyn BatchSubmitter>,
        period: Duration,
    ) -> Self {
        Self {
            queue,
            submitter,
            period,
        }
    }

    pub async fn run(&self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(period_ms = self.period.as_millis(), "Starting dispatch loop");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Received shutdown signal, stopping dispatch loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_ready().await;
                }
            }
        }

        Ok(())
    }

    /// One pass: drain every ready key and hand each batch off.
    pub async fn flush_ready(&self) {
        for (key, records) in self.queue.drain_ready() {
            let batch = SensorBatch {
                topic: key.topic,
                entity_id: key.entity_id.clone(),
                dispatched_at: Utc::now(),
                records,
            };
            debug!(key = %key, batch_size = batch.len(), "dispatching batch");
            if let Err(e) = self.submitter.submit(batch).await {
                error!(key = %key, error = %e, "failed to submit batch, continuing");
            }
        }
    }
}
