use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use std::sync::Arc;
use sudspoint_core::{AggregateId, ExpectedVersion, SiteId};

/// An event ready to be appended to a stream (no sequence number yet).
///
/// Lifecycle of an event:
///
/// 1. Domain event, produced by an aggregate's `handle()`
/// 2. `UncommittedEvent`, wrapped with stream metadata (site, aggregate)
/// 3. `StoredEvent`, persisted with an assigned `sequence_number`
/// 4. `EventEnvelope`, published to the bus for read models
///
/// Build one with [`UncommittedEvent::from_typed`], which serializes the
/// domain event to JSON and captures the metadata (`event_type`, schema
/// version, business time) needed to deserialize it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub site_id: SiteId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A persisted event with its position in the stream.
///
/// Sequence numbers are assigned by the store during append: monotonically
/// increasing per stream (the stream key is `(site_id, aggregate_id)`),
/// starting at 1, and immutable once assigned. They drive ordering,
/// optimistic concurrency checks and projection cursors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub site_id: SiteId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert into a site-scoped envelope for publication on the bus.
    pub fn to_envelope(&self) -> sudspoint_events::EventEnvelope<JsonValue> {
        sudspoint_events::EventEnvelope::new(
            self.event_id,
            self.site_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// Infrastructure failures (storage, concurrency, isolation), distinct from
/// the domain's `DomainError`.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("site isolation violation: {0}")]
    SiteIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only, site-scoped event store.
///
/// Streams are keyed by `(site_id, aggregate_id)`: one car-wash site never
/// sees another site's vehicle counters, orders or commission entries, on
/// either the read or the write path.
///
/// `append()` must:
/// - reject batches that mix sites, aggregates or aggregate types
/// - check `expected_version` against the current stream version (this CAS
///   is the only concurrency primitive the engine relies on; there are no
///   in-process locks around domain state)
/// - assign sequence numbers starting at `current_version + 1` and persist
///   the batch atomically
///
/// `load_stream()` returns the full stream in sequence order, or an empty
/// vector when the aggregate has no history yet.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream (append-only).
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a site + aggregate.
    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(site_id, aggregate_id)
    }
}

impl UncommittedEvent {
    /// Wrap a typed domain event with stream metadata.
    pub fn from_typed<E>(
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: sudspoint_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            site_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
