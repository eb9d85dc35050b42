use common::domain::{BatchKey, SensorRecord, SensorTopic};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Static flush policy: a per-topic size threshold plus one global timeout.
///
/// Topics have very different natural cadences (one reassembled clip per
/// audio flush versus a steady accelerometer sample stream), so the size
/// threshold is per topic, while the timeout bounds latency for keys that
/// never reach their threshold.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub audio_threshold: usize,
    pub accelerometer_threshold: usize,
    pub camera_threshold: usize,
    pub flush_timeout: Duration,
}

impl BatchPolicy {
    fn threshold(&self, topic: SensorTopic) -> usize {
        match topic {
            SensorTopic::Audio => self.audio_threshold,
            SensorTopic::Accelerometer => self.accelerometer_threshold,
            SensorTopic::Camera => self.camera_threshold,
        }
    }
}

struct QueueEntry {
    items: VecDeque<SensorRecord>,
    last_flush: Instant,
}

/// Thread-safe windowed batching keyed by (topic, entity).
///
/// One mutex guards the whole map, making append and drain-snapshot atomic
/// with respect to each other: no record is ever handed to two drains, and
/// none is lost between append and drain. Critical sections do no I/O.
/// Entries are created on first use and reused for the life of the
/// process, since entities are long-lived.
pub struct WindowedBatchQueue {
    policy: BatchPolicy,
    entries: Mutex<HashMap<BatchKey, QueueEntry>>,
}

impl WindowedBatchQueue {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record to the FIFO for a key, creating the entry (and
    /// starting its flush clock) if the key is new.
    pub fn enqueue(&self, key: BatchKey, record: SensorRecord) {
        let mut entries = self.entries.lock().expect("batch queue lock poisoned");
        let entry = entries.entry(key).or_insert_with(|| QueueEntry {
            items: VecDeque::new(),
            last_flush: Instant::now(),
        });
        entry.items.push_back(record);
    }

    /// Atomically remove and return the full contents of every ready key,
    /// resetting each drained key's flush clock.
    ///
    /// A key is ready when its queue is non-empty and it either reached the
    /// topic's size threshold or its flush clock exceeded the timeout.
    pub fn drain_ready(&self) -> Vec<(BatchKey, Vec<SensorRecord>)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("batch queue lock poisoned");
        let mut drained = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if entry.items.is_empty() {
                continue;
            }
            let due_by_size = entry.items.len() >= self.policy.threshold(key.topic);
            let due_by_time = now.duration_since(entry.last_flush) >= self.policy.flush_timeout;
            if due_by_size || due_by_time {
                debug!(
                    key = %key,
                    batch_size = entry.items.len(),
                    due_by_size,
                    due_by_time,
                    "draining batch window"
                );
                drained.push((key.clone(), entry.items.drain(..).collect()));
                entry.last_flush = now;
            }
        }
        drained
    }

    /// Number of records currently queued for a key.
    pub fn queued_len(&self, key: &BatchKey) -> usize {
        let entries = self.entries.lock().expect("batch queue lock poisoned");
        entries.get(key).map_or(0, |entry| entry.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::domain::RecordData;

    fn policy(threshold: usize, timeout: Duration) -> BatchPolicy {
        BatchPolicy {
            audio_threshold: threshold,
            accelerometer_threshold: threshold,
            camera_threshold: threshold,
            flush_timeout: timeout,
        }
    }

    fn record(entity_id: &str, tag: u64) -> SensorRecord {
        let mut fields = serde_json::Map::new();
        fields.insert("seq".to_string(), serde_json::json!(tag));
        SensorRecord {
            entity_id: entity_id.to_string(),
            occurred_at: Utc::now(),
            data: RecordData::Sample { fields },
        }
    }

    fn key(entity_id: &str) -> BatchKey {
        BatchKey::new(SensorTopic::Accelerometer, entity_id)
    }

    #[test]
    fn test_flush_by_size_threshold() {
        let queue = WindowedBatchQueue::new(policy(5, Duration::from_secs(600)));

        for i in 0..4 {
            queue.enqueue(key("cow-1"), record("cow-1", i));
        }
        assert!(queue.drain_ready().is_empty());

        queue.enqueue(key("cow-1"), record("cow-1", 4));
        let drained = queue.drain_ready();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, key("cow-1"));
        assert_eq!(drained[0].1.len(), 5);
        assert_eq!(queue.queued_len(&key("cow-1")), 0);
    }

    #[test]
    fn test_flush_by_timeout() {
        let queue = WindowedBatchQueue::new(policy(100, Duration::from_millis(20)));

        queue.enqueue(key("cow-1"), record("cow-1", 0));
        assert!(queue.drain_ready().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        let drained = queue.drain_ready();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.len(), 1);
    }

    #[test]
    fn test_drain_resets_flush_clock() {
        let queue = WindowedBatchQueue::new(policy(100, Duration::from_millis(30)));

        queue.enqueue(key("cow-1"), record("cow-1", 0));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(queue.drain_ready().len(), 1);

        // The clock restarted on drain, so a fresh record is not yet due
        queue.enqueue(key("cow-1"), record("cow-1", 1));
        assert!(queue.drain_ready().is_empty());
    }

    #[test]
    fn test_keys_are_isolated() {
        let queue = WindowedBatchQueue::new(policy(2, Duration::from_secs(600)));

        queue.enqueue(key("cow-1"), record("cow-1", 0));
        queue.enqueue(key("cow-1"), record("cow-1", 1));
        queue.enqueue(key("cow-2"), record("cow-2", 2));

        let drained = queue.drain_ready();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, key("cow-1"));
        assert!(drained[0].1.iter().all(|r| r.entity_id == "cow-1"));
        assert_eq!(queue.queued_len(&key("cow-2")), 1);
    }

    #[test]
    fn test_per_topic_thresholds() {
        let queue = WindowedBatchQueue::new(BatchPolicy {
            audio_threshold: 1,
            accelerometer_threshold: 20,
            camera_threshold: 1,
            flush_timeout: Duration::from_secs(600),
        });

        let audio_key = BatchKey::new(SensorTopic::Audio, "cow-1");
        queue.enqueue(audio_key.clone(), record("cow-1", 0));
        queue.enqueue(key("cow-1"), record("cow-1", 1));

        let drained = queue.drain_ready();

        // One audio clip flushes immediately; one accelerometer sample waits
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, audio_key);
    }

    #[test]
    fn test_drained_records_preserve_fifo_order() {
        let queue = WindowedBatchQueue::new(policy(3, Duration::from_secs(600)));

        for i in 0..3 {
            queue.enqueue(key("cow-1"), record("cow-1", i));
        }
        let drained = queue.drain_ready();

        let tags: Vec<u64> = drained[0]
            .1
            .iter()
            .map(|r| match &r.data {
                RecordData::Sample { fields } => fields["seq"].as_u64().unwrap(),
                other => panic!("unexpected record: {other:?}"),
            })
            .collect();
        assert_eq!(tags, vec![0, 1, 2]);
    }
}
