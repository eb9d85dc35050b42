use crate::domain::result::{DomainError, DomainResult};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The sensor topics this worker knows how to ingest.
///
/// Routing is an explicit match on this enum, so adding a topic is a
/// compile-time-visible change rather than a silent lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorTopic {
    Audio,
    Accelerometer,
    Camera,
}

impl SensorTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorTopic::Audio => "audio",
            SensorTopic::Accelerometer => "accelerometer",
            SensorTopic::Camera => "camera",
        }
    }
}

impl fmt::Display for SensorTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition of a chunked audio transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSignal {
    Start {
        declared_chunks: usize,
        timestamp: DateTime<Utc>,
    },
    Data {
        index: usize,
        payload: Vec<u8>,
    },
    End,
}

/// A parsed inbound bus message. Ephemeral: it exists only while one
/// delivery is being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorMessage {
    pub topic: SensorTopic,
    pub entity_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Audio(AudioSignal),
    Sample {
        occurred_at: DateTime<Utc>,
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

/// Wire shape of an audio-topic message as emitted by the microphone
/// firmware: `start` declares the chunk count, `data` carries one
/// base64-encoded fragment at an explicit index, `end` closes the session.
#[derive(Deserialize)]
struct AudioWire {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    chunks: Option<u64>,
    #[serde(default)]
    index: Option<u64>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl SensorMessage {
    /// Parse one raw bus payload for a known topic.
    pub fn parse(topic: SensorTopic, payload: &[u8]) -> DomainResult<Self> {
        match topic {
            SensorTopic::Audio => Self::parse_audio(payload),
            SensorTopic::Accelerometer | SensorTopic::Camera => Self::parse_sample(topic, payload),
        }
    }

    fn parse_audio(payload: &[u8]) -> DomainResult<Self> {
        let wire: AudioWire = serde_json::from_slice(payload).map_err(|e| {
            DomainError::MalformedMessage(SensorTopic::Audio.to_string(), e.to_string())
        })?;

        let entity_id = wire
            .entity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DomainError::MissingEntityId(SensorTopic::Audio.to_string()))?;

        let body = match wire.kind.as_str() {
            "start" => {
                let declared_chunks = wire.chunks.filter(|c| *c > 0).ok_or_else(|| {
                    DomainError::InvalidAudioSignal(
                        "start signal missing a positive chunk count".to_string(),
                    )
                })? as usize;
                MessageBody::Audio(AudioSignal::Start {
                    declared_chunks,
                    timestamp: parse_timestamp(wire.timestamp.as_deref()),
                })
            }
            "data" => {
                let index = wire.index.ok_or_else(|| {
                    DomainError::InvalidAudioSignal("data signal missing an index".to_string())
                })? as usize;
                let encoded = wire.data.ok_or_else(|| {
                    DomainError::InvalidAudioSignal("data signal missing a payload".to_string())
                })?;
                let payload = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| DomainError::PayloadDecode(e.to_string()))?;
                MessageBody::Audio(AudioSignal::Data { index, payload })
            }
            "end" => MessageBody::Audio(AudioSignal::End),
            other => {
                return Err(DomainError::InvalidAudioSignal(format!(
                    "unknown signal kind: {other}"
                )));
            }
        };

        Ok(Self {
            topic: SensorTopic::Audio,
            entity_id,
            body,
        })
    }

    fn parse_sample(topic: SensorTopic, payload: &[u8]) -> DomainResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| DomainError::MalformedMessage(topic.to_string(), e.to_string()))?;

        let serde_json::Value::Object(fields) = value else {
            return Err(DomainError::MalformedMessage(
                topic.to_string(),
                "payload is not a JSON object".to_string(),
            ));
        };

        let entity_id = fields
            .get("entity_id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DomainError::MissingEntityId(topic.to_string()))?
            .to_string();

        let occurred_at =
            parse_timestamp(fields.get("timestamp").and_then(|v| v.as_str()));

        Ok(Self {
            topic,
            entity_id,
            body: MessageBody::Sample {
                occurred_at,
                fields,
            },
        })
    }
}

/// Parse a wire timestamp. Sensors emit RFC 3339 or a naive
/// `%Y-%m-%dT%H:%M:%S` local format; anything unparseable falls back to
/// arrival time.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return naive.and_utc();
    }
    Utc::now()
}
