use std::collections::HashMap;
use std::sync::RwLock;

use sudspoint_core::{AggregateId, ExpectedVersion, SiteId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    site_id: SiteId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// The CAS check and the append happen under one write lock, so it gives the
/// same per-stream atomicity a production backend would. Intended for
/// tests/dev; not optimized for large histories.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        // All events must target the same site + aggregate stream.
        let site_id = events[0].site_id;
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.site_id != site_id {
                return Err(EventStoreError::SiteIsolation(format!(
                    "batch contains multiple site_ids (index {idx})"
                )));
            }
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let key = StreamKey {
            site_id,
            aggregate_id,
        };

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams.entry(key).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        // A stream holds one aggregate type for its whole life.
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        // Assign sequence numbers and append (append-only).
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                site_id: e.site_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            site_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn test_event(site_id: SiteId, aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            site_id,
            aggregate_id,
            aggregate_type: "vehicles.ledger".to_string(),
            event_type: "vehicles.ledger.paid_wash_counted".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({"new_count": 1}),
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let site_id = SiteId::new();
        let aggregate_id = AggregateId::new();

        let first = store
            .append(vec![test_event(site_id, aggregate_id)], ExpectedVersion::Any)
            .unwrap();
        assert_eq!(first[0].sequence_number, 1);

        let second = store
            .append(
                vec![
                    test_event(site_id, aggregate_id),
                    test_event(site_id, aggregate_id),
                ],
                ExpectedVersion::Exact(1),
            )
            .unwrap();
        assert_eq!(second[0].sequence_number, 2);
        assert_eq!(second[1].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_rejected() {
        let store = InMemoryEventStore::new();
        let site_id = SiteId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(vec![test_event(site_id, aggregate_id)], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![test_event(site_id, aggregate_id)], ExpectedVersion::Exact(0))
            .unwrap_err();
        match err {
            EventStoreError::Concurrency(_) => {}
            other => panic!("Expected Concurrency error, got {other:?}"),
        }
    }

    #[test]
    fn batches_mixing_sites_are_rejected() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let err = store
            .append(
                vec![
                    test_event(SiteId::new(), aggregate_id),
                    test_event(SiteId::new(), aggregate_id),
                ],
                ExpectedVersion::Any,
            )
            .unwrap_err();
        match err {
            EventStoreError::SiteIsolation(_) => {}
            other => panic!("Expected SiteIsolation error, got {other:?}"),
        }
    }

    #[test]
    fn streams_are_isolated_per_site() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let site_a = SiteId::new();
        let site_b = SiteId::new();

        store
            .append(vec![test_event(site_a, aggregate_id)], ExpectedVersion::Any)
            .unwrap();

        assert!(store.load_stream(site_b, aggregate_id).unwrap().is_empty());
        assert_eq!(store.load_stream(site_a, aggregate_id).unwrap().len(), 1);
    }

    #[test]
    fn load_stream_of_unknown_aggregate_is_empty() {
        let store = InMemoryEventStore::new();
        assert!(
            store
                .load_stream(SiteId::new(), AggregateId::new())
                .unwrap()
                .is_empty()
        );
    }
}
