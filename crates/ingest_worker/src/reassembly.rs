use chrono::{DateTime, Utc};
use common::domain::{AudioSignal, RecordData, SensorRecord};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// One in-flight chunked audio transfer for a single entity.
///
/// Sessions live only in memory; a worker restart drops them and the next
/// `start` begins fresh.
struct ReassemblySession {
    declared_chunks: usize,
    fragments: HashMap<usize, Vec<u8>>,
    opened_at: DateTime<Utc>,
}

/// Reconstructs chunked audio transmissions, one state machine per entity.
///
/// Fragment order is recovered from the explicit index field; the bus gives
/// no ordering guarantee. A session completes only when the number of
/// distinct fragments matches the count declared by `start`. A partial
/// session is unusable audio and is dropped loudly instead of emitted.
pub struct AudioReassembler {
    sessions: Mutex<HashMap<String, ReassemblySession>>,
}

impl Default for AudioReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioReassembler {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one audio signal for an entity. Returns a completed record
    /// when `end` closes a session holding exactly the declared fragment
    /// count.
    pub fn handle(&self, entity_id: &str, signal: AudioSignal) -> Option<SensorRecord> {
        let mut sessions = self.sessions.lock().expect("reassembler lock poisoned");
        match signal {
            AudioSignal::Start {
                declared_chunks,
                timestamp,
            } => {
                let fresh = ReassemblySession {
                    declared_chunks,
                    fragments: HashMap::new(),
                    opened_at: timestamp,
                };
                if let Some(prev) = sessions.insert(entity_id.to_string(), fresh) {
                    warn!(
                        entity_id,
                        discarded_fragments = prev.fragments.len(),
                        "new audio session started before previous one ended, discarding prior fragments"
                    );
                }
                debug!(entity_id, declared_chunks, "opened audio session");
                None
            }
            AudioSignal::Data { index, payload } => {
                let Some(session) = sessions.get_mut(entity_id) else {
                    warn!(entity_id, index, "audio fragment without an open session, ignored");
                    return None;
                };
                session.fragments.insert(index, payload);
                if session.fragments.len() > session.declared_chunks {
                    warn!(
                        entity_id,
                        declared = session.declared_chunks,
                        received = session.fragments.len(),
                        "fragment count exceeded declared total, discarding session"
                    );
                    sessions.remove(entity_id);
                }
                None
            }
            AudioSignal::End => {
                let Some(session) = sessions.remove(entity_id) else {
                    warn!(entity_id, "audio end without an open session, ignored");
                    return None;
                };
                if session.fragments.len() != session.declared_chunks {
                    warn!(
                        entity_id,
                        declared = session.declared_chunks,
                        received = session.fragments.len(),
                        "incomplete audio session at end, discarding"
                    );
                    return None;
                }

                let mut indices: Vec<usize> = session.fragments.keys().copied().collect();
                indices.sort_unstable();
                let mut samples = Vec::new();
                for index in indices {
                    samples.extend_from_slice(&session.fragments[&index]);
                }

                info!(
                    entity_id,
                    chunks = session.declared_chunks,
                    bytes = samples.len(),
                    "completed audio session"
                );
                Some(SensorRecord {
                    entity_id: entity_id.to_string(),
                    occurred_at: session.opened_at,
                    data: RecordData::Audio { samples },
                })
            }
        }
    }

    /// Number of currently open sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().expect("reassembler lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start(n: usize) -> AudioSignal {
        AudioSignal::Start {
            declared_chunks: n,
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        }
    }

    fn data(index: usize, payload: &[u8]) -> AudioSignal {
        AudioSignal::Data {
            index,
            payload: payload.to_vec(),
        }
    }

    fn audio_bytes(record: SensorRecord) -> Vec<u8> {
        match record.data {
            RecordData::Audio { samples } => samples,
            other => panic!("expected audio record, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_fragments_reassemble_by_index() {
        let reassembler = AudioReassembler::new();

        assert!(reassembler.handle("cow-1", start(3)).is_none());
        assert!(reassembler.handle("cow-1", data(2, b"C")).is_none());
        assert!(reassembler.handle("cow-1", data(0, b"A")).is_none());
        assert!(reassembler.handle("cow-1", data(1, b"B")).is_none());

        let record = reassembler.handle("cow-1", AudioSignal::End).unwrap();

        assert_eq!(audio_bytes(record), b"ABC");
        assert_eq!(reassembler.open_sessions(), 0);
    }

    #[test]
    fn test_incomplete_session_discarded_at_end() {
        let reassembler = AudioReassembler::new();

        reassembler.handle("cow-1", start(3));
        reassembler.handle("cow-1", data(0, b"A"));
        reassembler.handle("cow-1", data(1, b"B"));

        assert!(reassembler.handle("cow-1", AudioSignal::End).is_none());
        // The discarded session does not leak into a fresh one
        assert_eq!(reassembler.open_sessions(), 0);
        reassembler.handle("cow-1", start(1));
        reassembler.handle("cow-1", data(0, b"Z"));
        let record = reassembler.handle("cow-1", AudioSignal::End).unwrap();
        assert_eq!(audio_bytes(record), b"Z");
    }

    #[test]
    fn test_restart_before_end_discards_old_session() {
        let reassembler = AudioReassembler::new();

        reassembler.handle("cow-1", start(3));
        reassembler.handle("cow-1", data(0, b"old"));
        reassembler.handle("cow-1", start(2));
        reassembler.handle("cow-1", data(0, b"new-a"));
        reassembler.handle("cow-1", data(1, b"new-b"));

        let record = reassembler.handle("cow-1", AudioSignal::End).unwrap();

        assert_eq!(audio_bytes(record), b"new-anew-b");
    }

    #[test]
    fn test_duplicate_index_overwrites() {
        let reassembler = AudioReassembler::new();

        reassembler.handle("cow-1", start(2));
        reassembler.handle("cow-1", data(0, b"first"));
        reassembler.handle("cow-1", data(0, b"second"));
        reassembler.handle("cow-1", data(1, b"!"));

        let record = reassembler.handle("cow-1", AudioSignal::End).unwrap();

        assert_eq!(audio_bytes(record), b"second!");
    }

    #[test]
    fn test_runaway_sender_discards_session() {
        let reassembler = AudioReassembler::new();

        reassembler.handle("cow-1", start(2));
        reassembler.handle("cow-1", data(0, b"a"));
        reassembler.handle("cow-1", data(1, b"b"));
        reassembler.handle("cow-1", data(2, b"c"));

        assert_eq!(reassembler.open_sessions(), 0);
        assert!(reassembler.handle("cow-1", AudioSignal::End).is_none());
    }

    #[test]
    fn test_signals_without_session_are_ignored() {
        let reassembler = AudioReassembler::new();

        assert!(reassembler.handle("cow-1", data(0, b"a")).is_none());
        assert!(reassembler.handle("cow-1", AudioSignal::End).is_none());
        assert_eq!(reassembler.open_sessions(), 0);
    }

    #[test]
    fn test_entities_have_independent_sessions() {
        let reassembler = AudioReassembler::new();

        reassembler.handle("cow-1", start(1));
        reassembler.handle("cow-2", start(1));
        reassembler.handle("cow-1", data(0, b"one"));
        reassembler.handle("cow-2", data(0, b"two"));

        let first = reassembler.handle("cow-1", AudioSignal::End).unwrap();
        let second = reassembler.handle("cow-2", AudioSignal::End).unwrap();

        assert_eq!(audio_bytes(first), b"one");
        assert_eq!(audio_bytes(second), b"two");
    }

    #[test]
    fn test_completed_record_carries_session_timestamp() {
        let reassembler = AudioReassembler::new();
        let opened = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();

        reassembler.handle(
            "cow-1",
            AudioSignal::Start {
                declared_chunks: 1,
                timestamp: opened,
            },
        );
        reassembler.handle("cow-1", data(0, b"x"));

        let record = reassembler.handle("cow-1", AudioSignal::End).unwrap();

        assert_eq!(record.occurred_at, opened);
        assert_eq!(record.entity_id, "cow-1");
    }
}
