use crate::domain::message::SensorTopic;
use crate::domain::record::SensorBatch;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Coarse result of one inference run: an opaque payload for persistence
/// plus an optional alert to raise.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome {
    pub result: serde_json::Value,
    pub alert: Option<String>,
}

/// A detection result to persist, keyed by entity and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub entity_id: String,
    pub topic: SensorTopic,
    pub occurred_at: DateTime<Utc>,
    pub result: serde_json::Value,
}

/// Inference entry point supplied by the ML subsystem.
///
/// Called once per flushed batch on a dedicated blocking thread.
/// Implementations are CPU-bound and must not touch engine state; the
/// engine only inspects the coarse success/failure signal and forwards the
/// opaque result to the persistence and alerting collaborators.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait InferenceRunner: Send + Sync {
    fn run_batch(&self, batch: &SensorBatch) -> DomainResult<InferenceOutcome>;
}

/// Append-only persistence for detection results.
///
/// Failures are logged by the caller, never retried.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn store_detection(&self, detection: &Detection) -> DomainResult<()>;
}

/// Outbound alerting for high-confidence detections.
///
/// Failures are logged by the caller, never retried.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, entity_id: &str, message: &str) -> DomainResult<()>;
}
