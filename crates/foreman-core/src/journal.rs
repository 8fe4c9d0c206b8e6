// Event Journal
// Append-only per-protocol log with strictly increasing ids, plus a live
// broadcast feed for subscribers. The journal is the authoritative state
// history; any external store is a projection.

use crate::error::Result;
use crate::ids::{Clock, IdProvider};
use crate::store::ProtocolStore;
use foreman_observability::ProtocolEvent;
use foreman_types::{EventCategory, EventRecord, ProtocolStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;

/// Fields the caller supplies for one event; seq/ids/timestamps are assigned
/// by the journal.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: &'static str,
    pub category: EventCategory,
    pub step_index: Option<u32>,
    pub message: String,
    pub metadata: Value,
}

impl EventDraft {
    pub fn new(kind: &'static str, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            kind,
            category,
            step_index: None,
            message: message.into(),
            metadata: Value::Null,
        }
    }

    pub fn step(mut self, step_index: u32) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct EventJournal {
    store: Arc<ProtocolStore>,
    clock: Clock,
    ids: IdProvider,
    /// Next seq per protocol; lazily seeded from the persisted log
    next_seq: StdMutex<HashMap<String, u64>>,
    bus: broadcast::Sender<EventRecord>,
}

impl EventJournal {
    pub fn new(store: Arc<ProtocolStore>) -> Self {
        let (bus, _) = broadcast::channel(2048);
        Self {
            store,
            clock: Clock::new(),
            ids: IdProvider,
            next_seq: StdMutex::new(HashMap::new()),
            bus,
        }
    }

    /// Append one event. Callers hold the protocol lease, which is what
    /// makes per-protocol seq assignment race-free.
    pub fn emit(
        &self,
        protocol_id: &str,
        status: ProtocolStatus,
        draft: EventDraft,
    ) -> Result<EventRecord> {
        let seq = self.advance_seq(protocol_id)?;

        let record = EventRecord {
            event_id: self.ids.new_id(),
            protocol_id: protocol_id.to_string(),
            seq,
            ts: self.clock.now_wall(),
            mono_ms: self.clock.mono_ms(),
            kind: draft.kind.to_string(),
            category: draft.category,
            status,
            step_index: draft.step_index,
            message: draft.message,
            metadata: draft.metadata,
        };

        self.store.append_event(&record)?;
        let _ = self.bus.send(record.clone());

        let mut line = ProtocolEvent::new("journal", "event_appended", protocol_id)
            .detail(&record.kind);
        if let Some(index) = record.step_index {
            line = line.step(index);
        }
        foreman_observability::emit(tracing::Level::DEBUG, &line);

        Ok(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.bus.subscribe()
    }

    /// Replay persisted events, optionally only those after `since_seq`.
    pub fn replay(&self, protocol_id: &str, since_seq: Option<u64>) -> Result<Vec<EventRecord>> {
        self.store.load_events(protocol_id, since_seq, None)
    }

    fn advance_seq(&self, protocol_id: &str) -> Result<u64> {
        let mut seqs = self.next_seq.lock().expect("journal seq map poisoned");
        let next = match seqs.get(protocol_id) {
            Some(next) => *next,
            None => self.store.latest_event_seq(protocol_id)? + 1,
        };
        seqs.insert(protocol_id.to_string(), next + 1);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn journal() -> (tempfile::TempDir, EventJournal) {
        let temp = tempdir().unwrap();
        let store = Arc::new(ProtocolStore::new(temp.path()).unwrap());
        (temp, EventJournal::new(store))
    }

    #[test]
    fn seq_is_strictly_increasing_per_protocol() {
        let (_temp, journal) = journal();

        for _ in 0..3 {
            journal
                .emit(
                    "proto-1",
                    ProtocolStatus::Running,
                    EventDraft::new("step_started", EventCategory::Execution, "s"),
                )
                .unwrap();
        }
        journal
            .emit(
                "proto-2",
                ProtocolStatus::Pending,
                EventDraft::new("protocol_created", EventCategory::Lifecycle, "c"),
            )
            .unwrap();

        let first = journal.replay("proto-1", None).unwrap();
        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        let mut last_mono = 0;
        for event in &first {
            assert!(event.mono_ms >= last_mono);
            last_mono = event.mono_ms;
        }

        // Seq spaces are independent per protocol.
        let second = journal.replay("proto-2", None).unwrap();
        assert_eq!(second[0].seq, 1);
    }

    #[test]
    fn seq_resumes_from_persisted_log() {
        let temp = tempdir().unwrap();
        let store = Arc::new(ProtocolStore::new(temp.path()).unwrap());

        {
            let journal = EventJournal::new(store.clone());
            journal
                .emit(
                    "proto-1",
                    ProtocolStatus::Pending,
                    EventDraft::new("protocol_created", EventCategory::Lifecycle, "c"),
                )
                .unwrap();
        }

        // A fresh journal over the same store continues the sequence.
        let journal = EventJournal::new(store);
        let record = journal
            .emit(
                "proto-1",
                ProtocolStatus::Planning,
                EventDraft::new("planning_started", EventCategory::Planning, "p"),
            )
            .unwrap();
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn live_subscribers_see_appends() {
        let (_temp, journal) = journal();
        let mut rx = journal.subscribe();

        journal
            .emit(
                "proto-1",
                ProtocolStatus::Running,
                EventDraft::new("step_started", EventCategory::Execution, "s").step(2),
            )
            .unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, "step_started");
        assert_eq!(received.step_index, Some(2));
    }
}
