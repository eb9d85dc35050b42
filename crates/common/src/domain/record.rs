use crate::domain::message::SensorTopic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The (topic, entity) pair that segregates queued telemetry into
/// independent batching windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub topic: SensorTopic,
    pub entity_id: String,
}

impl BatchKey {
    pub fn new(topic: SensorTopic, entity_id: impl Into<String>) -> Self {
        Self {
            topic,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.entity_id)
    }
}

/// One unit of telemetry awaiting dispatch.
///
/// Records are serde round-trippable so they can ride inside a job
/// announcement in distributed mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordData {
    /// A fully reassembled audio clip: contiguous sample bytes.
    Audio {
        #[serde(with = "base64_bytes")]
        samples: Vec<u8>,
    },
    /// A single sample from a non-chunked topic. Fields are opaque to the
    /// engine and passed through to inference untouched.
    Sample {
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

/// A finalized batch handed to execution as one unit.
///
/// Every record in the batch shares the batch's (topic, entity) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBatch {
    pub topic: SensorTopic,
    pub entity_id: String,
    pub dispatched_at: DateTime<Utc>,
    pub records: Vec<SensorRecord>,
}

impl SensorBatch {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.topic, self.entity_id.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Byte fields travel as standard base64, wire-compatible with the sensor
/// firmware's encoding.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> SensorRecord {
        let mut fields = serde_json::Map::new();
        fields.insert("metric".to_string(), serde_json::json!(1.5));
        SensorRecord {
            entity_id: "cow-1".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
            data: RecordData::Sample { fields },
        }
    }

    #[test]
    fn test_audio_record_serializes_as_base64() {
        let record = SensorRecord {
            entity_id: "cow-1".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
            data: RecordData::Audio {
                samples: vec![0x01, 0x02, 0xff],
            },
        };

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["kind"], "audio");
        assert_eq!(json["samples"], "AQL/");

        let back: SensorRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_batch_round_trips_through_json() {
        let batch = SensorBatch {
            topic: SensorTopic::Accelerometer,
            entity_id: "cow-1".to_string(),
            dispatched_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
            records: vec![sample_record()],
        };

        let encoded = serde_json::to_vec(&batch).unwrap();
        let decoded: SensorBatch = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, batch);
        assert_eq!(decoded.key(), BatchKey::new(SensorTopic::Accelerometer, "cow-1"));
    }

    #[test]
    fn test_batch_key_display() {
        let key = BatchKey::new(SensorTopic::Audio, "cow-7");
        assert_eq!(key.to_string(), "audio/cow-7");
    }
}
