use crate::batch_queue::WindowedBatchQueue;
use crate::reassembly::AudioReassembler;
use common::domain::{BatchKey, DomainError, MessageBody, SensorMessage, SensorRecord, SensorTopic};
use common::domain::RecordData;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maps configured bus subjects to the topics this worker ingests.
#[derive(Debug, Clone)]
pub struct SubjectMap {
    pub audio: String,
    pub accelerometer: String,
    pub camera: String,
}

impl SubjectMap {
    pub fn resolve(&self, subject: &str) -> Option<SensorTopic> {
        if subject == self.audio {
            Some(SensorTopic::Audio)
        } else if subject == self.accelerometer {
            Some(SensorTopic::Accelerometer)
        } else if subject == self.camera {
            Some(SensorTopic::Camera)
        } else {
            None
        }
    }

    pub fn subjects(&self) -> [&str; 3] {
        [&self.audio, &self.accelerometer, &self.camera]
    }
}

/// Entry point for inbound bus deliveries: parse, classify, route.
///
/// Deliveries are handled one at a time. Nothing here blocks beyond a brief
/// queue append, and no failure propagates to the subscriber loop: every
/// drop is logged with topic, entity and reason so data loss can be
/// diagnosed after the fact. Bus messages are never re-queued by this
/// layer.
pub struct MessageIngress {
    subjects: SubjectMap,
    reassembler: Arc<AudioReassembler>,
    queue: Arc<WindowedBatchQueue>,
}

impl MessageIngress {
    pub fn new(
        subjects: SubjectMap,
        reassembler: Arc<AudioReassembler>,
        queue: Arc<WindowedBatchQueue>,
    ) -> Self {
        Self {
            subjects,
            reassembler,
            queue,
        }
    }

    /// Handle one raw delivery.
    pub fn handle(&self, subject: &str, payload: &[u8]) {
        let Some(topic) = self.subjects.resolve(subject) else {
            error!(subject, "message on unrecognized topic dropped");
            return;
        };

        let message = match SensorMessage::parse(topic, payload) {
            Ok(message) => message,
            Err(e @ DomainError::MissingEntityId(_)) => {
                warn!(topic = %topic, error = %e, "dropped message without entity id");
                return;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropped unparseable message");
                return;
            }
        };

        self.route(message);
    }

    fn route(&self, message: SensorMessage) {
        match message.body {
            MessageBody::Audio(signal) => {
                if let Some(record) = self.reassembler.handle(&message.entity_id, signal) {
                    let key = BatchKey::new(SensorTopic::Audio, message.entity_id);
                    self.queue.enqueue(key, record);
                }
            }
            MessageBody::Sample {
                occurred_at,
                fields,
            } => {
                let key = BatchKey::new(message.topic, message.entity_id.clone());
                debug!(key = %key, "queued sensor sample");
                self.queue.enqueue(
                    key,
                    SensorRecord {
                        entity_id: message.entity_id,
                        occurred_at,
                        data: RecordData::Sample { fields },
                    },
                );
            }
        }
    }

    /// Run the sensor subscriber loop: merge the topic subscriptions and
    /// feed deliveries through ingress until cancelled.
    pub async fn run(
        self: Arc<Self>,
        subscribers: Vec<async_nats::Subscriber>,
        ctx: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(subjects = ?self.subjects.subjects(), "Starting sensor ingress loop");
        let mut merged = futures::stream::select_all(subscribers);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Received shutdown signal, stopping ingress");
                    break;
                }
                maybe = merged.next() => {
                    let Some(msg) = maybe else {
                        warn!("sensor subscriptions closed, stopping ingress");
                        break;
                    };
                    self.handle(msg.subject.as_str(), &msg.payload);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_queue::BatchPolicy;
    use std::time::Duration;

    fn subjects() -> SubjectMap {
        SubjectMap {
            audio: "sensor.audio".to_string(),
            accelerometer: "sensor.accelerometer".to_string(),
            camera: "sensor.camera".to_string(),
        }
    }

    fn ingress() -> (MessageIngress, Arc<WindowedBatchQueue>, Arc<AudioReassembler>) {
        let queue = Arc::new(WindowedBatchQueue::new(BatchPolicy {
            audio_threshold: 1,
            accelerometer_threshold: 20,
            camera_threshold: 1,
            flush_timeout: Duration::from_secs(600),
        }));
        let reassembler = Arc::new(AudioReassembler::new());
        let ingress = MessageIngress::new(subjects(), reassembler.clone(), queue.clone());
        (ingress, queue, reassembler)
    }

    #[test]
    fn test_sample_topics_enqueue_directly() {
        let (ingress, queue, _) = ingress();

        ingress.handle(
            "sensor.accelerometer",
            br#"{"entity_id":"cow-1","metric":0.4}"#,
        );

        let key = BatchKey::new(SensorTopic::Accelerometer, "cow-1");
        assert_eq!(queue.queued_len(&key), 1);
    }

    #[test]
    fn test_audio_messages_flow_through_reassembly() {
        let (ingress, queue, reassembler) = ingress();

        ingress.handle(
            "sensor.audio",
            br#"{"entity_id":"cow-1","type":"start","chunks":1}"#,
        );
        assert_eq!(reassembler.open_sessions(), 1);

        // "QQ==" is base64 for "A"
        ingress.handle(
            "sensor.audio",
            br#"{"entity_id":"cow-1","type":"data","index":0,"data":"QQ=="}"#,
        );
        // Fragments alone never reach the queue
        let key = BatchKey::new(SensorTopic::Audio, "cow-1");
        assert_eq!(queue.queued_len(&key), 0);

        ingress.handle("sensor.audio", br#"{"entity_id":"cow-1","type":"end"}"#);
        assert_eq!(queue.queued_len(&key), 1);
        assert_eq!(reassembler.open_sessions(), 0);
    }

    #[test]
    fn test_unrecognized_subject_is_dropped() {
        let (ingress, queue, _) = ingress();

        ingress.handle("sensor.gps", br#"{"entity_id":"cow-1"}"#);

        assert_eq!(queue.queued_len(&BatchKey::new(SensorTopic::Camera, "cow-1")), 0);
        assert_eq!(
            queue.queued_len(&BatchKey::new(SensorTopic::Accelerometer, "cow-1")),
            0
        );
    }

    #[test]
    fn test_malformed_payloads_are_dropped() {
        let (ingress, queue, reassembler) = ingress();

        ingress.handle("sensor.camera", b"not json");
        ingress.handle("sensor.camera", br#"{"frame":"no-entity"}"#);
        ingress.handle("sensor.audio", br#"{"entity_id":"cow-1","type":"start"}"#);

        assert_eq!(queue.queued_len(&BatchKey::new(SensorTopic::Camera, "cow-1")), 0);
        // The invalid start (no chunk count) opened no session
        assert_eq!(reassembler.open_sessions(), 0);
    }

    #[test]
    fn test_invalid_start_leaves_open_session_untouched() {
        let (ingress, _, reassembler) = ingress();

        ingress.handle(
            "sensor.audio",
            br#"{"entity_id":"cow-1","type":"start","chunks":2}"#,
        );
        ingress.handle(
            "sensor.audio",
            br#"{"entity_id":"cow-1","type":"start","chunks":0}"#,
        );

        assert_eq!(reassembler.open_sessions(), 1);
    }
}
