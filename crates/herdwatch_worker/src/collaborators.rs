//! Default collaborator wiring for the inference, persistence and alerting
//! seams. Real deployments swap these for the ML, database and SMS
//! integrations; the engine only ever sees the traits.

use async_trait::async_trait;
use common::domain::{
    AlertNotifier, Detection, DetectionStore, DomainResult, InferenceOutcome, InferenceRunner,
    RecordData, SensorBatch,
};
use tracing::info;

/// Scores a batch by averaging the per-record distress probabilities the
/// sensors report, ignoring insignificant ones, and raises an alert when
/// the average crosses the configured threshold.
pub struct DistressScoreRunner {
    /// Probabilities at or below this are noise and excluded from the mean.
    pub significance_floor: f64,
    pub alert_threshold: f64,
}

impl InferenceRunner for DistressScoreRunner {
    fn run_batch(&self, batch: &SensorBatch) -> DomainResult<InferenceOutcome> {
        let mut significant = Vec::new();
        let mut audio_bytes = 0usize;
        for record in &batch.records {
            match &record.data {
                RecordData::Sample { fields } => {
                    if let Some(probability) = fields.get("probability").and_then(|v| v.as_f64()) {
                        if probability > self.significance_floor {
                            significant.push(probability);
                        }
                    }
                }
                RecordData::Audio { samples } => audio_bytes += samples.len(),
            }
        }

        let avg_probability = if significant.is_empty() {
            0.0
        } else {
            significant.iter().sum::<f64>() / significant.len() as f64
        };

        let alert = (avg_probability >= self.alert_threshold).then(|| {
            format!(
                "distress probability {:.3} for entity {}",
                avg_probability, batch.entity_id
            )
        });

        Ok(InferenceOutcome {
            result: serde_json::json!({
                "entity_id": batch.entity_id,
                "topic": batch.topic,
                "batch_size": batch.len(),
                "audio_bytes": audio_bytes,
                "avg_probability": avg_probability,
            }),
            alert,
        })
    }
}

/// Persistence seam that records detections in the log stream only.
pub struct LogDetectionStore;

#[async_trait]
impl DetectionStore for LogDetectionStore {
    async fn store_detection(&self, detection: &Detection) -> DomainResult<()> {
        info!(
            entity_id = %detection.entity_id,
            topic = %detection.topic,
            occurred_at = %detection.occurred_at,
            result = %detection.result,
            "detection result"
        );
        Ok(())
    }
}

/// Alerting seam that raises alerts in the log stream only.
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn notify(&self, entity_id: &str, message: &str) -> DomainResult<()> {
        info!(entity_id, message, "alert raised");
        Ok(())
    }
}
