use crate::domain::record::SensorBatch;
use serde::{Deserialize, Serialize};

/// A replica's claim on an announced job. Lower score means more available
/// capacity; ties are broken by worker id ordering downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub job_id: String,
    pub worker_id: String,
    pub score: f64,
}

/// A job broadcast to every replica on the announcement subject.
///
/// The announcement embeds the finalized batch so the winning replica can
/// execute it without any further round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAnnouncement {
    pub job_id: String,
    #[serde(flatten)]
    pub batch: SensorBatch,
}

impl JobAnnouncement {
    pub fn new(job_id: impl Into<String>, batch: SensorBatch) -> Self {
        Self {
            job_id: job_id.into(),
            batch,
        }
    }

    pub fn into_batch(self) -> SensorBatch {
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordData, SensorRecord, SensorTopic};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_announcement_round_trips_with_flattened_batch() {
        let batch = SensorBatch {
            topic: SensorTopic::Audio,
            entity_id: "cow-1".to_string(),
            dispatched_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
            records: vec![SensorRecord {
                entity_id: "cow-1".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 59, 0).unwrap(),
                data: RecordData::Audio {
                    samples: vec![1, 2, 3],
                },
            }],
        };
        let announcement = JobAnnouncement::new("job-42", batch.clone());

        let json = serde_json::to_value(&announcement).unwrap();
        assert_eq!(json["job_id"], "job-42");
        // Batch fields sit at the top level of the wire object
        assert_eq!(json["topic"], "audio");
        assert_eq!(json["entity_id"], "cow-1");

        let decoded: JobAnnouncement = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.into_batch(), batch);
    }
}
