//! Command execution pipeline for event-sourced aggregates.
//!
//! One consistent lifecycle for every command, no matter which aggregate it
//! targets:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (site-scoped)
//!   ↓
//! 2. Rehydrate aggregate (apply history to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to the bus (read models)
//! ```
//!
//! Site isolation, optimistic concurrency and event ordering are all enforced
//! here, once, instead of in every caller. The dispatcher composes the
//! `EventStore` and `EventBus` traits and contains no IO of its own, so it
//! runs unchanged against in-memory implementations in tests and real
//! backends in production.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use sudspoint_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, SiteId};
use sudspoint_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version).
    Concurrency(String),
    /// Site isolation violation (cross-site or cross-aggregate stream mixing).
    SiteIsolation(String),
    /// Domain validation failure (deterministic).
    Validation(String),
    /// The operation is not allowed in the aggregate's current state.
    InvalidState(String),
    /// An exactly-once record already exists.
    Duplicate(String),
    /// Stored data contradicts a domain invariant (fatal, never patched).
    Consistency(String),
    /// Domain-level not found.
    NotFound,
    /// Failed to deserialize historical event payloads into the aggregate event type.
    Deserialize(String),
    /// Persisting to the event store failed.
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::SiteIsolation(msg) => DispatchError::SiteIsolation(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidState(msg) => DispatchError::InvalidState(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::Duplicate(msg) => DispatchError::Duplicate(msg),
            DomainError::Consistency(msg) => DispatchError::Consistency(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Execution guarantees:
///
/// - **Atomicity**: events are persisted before publication; if the append
///   fails nothing is published
/// - **Consistency**: the append carries `ExpectedVersion::Exact` of the
///   version just loaded, so a concurrent writer on the same stream makes
///   the append fail with [`DispatchError::Concurrency`] instead of silently
///   losing a write
/// - **Isolation**: each command operates on a single aggregate stream,
///   scoped to one site
///
/// If publication fails after a successful append the events are already
/// durable; the caller sees [`DispatchError::Publish`] and can retry, giving
/// at-least-once delivery towards projections (which are idempotent).
///
/// Generic over the store and bus so tests run fully in memory.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// `make_aggregate` is a factory for a fresh instance (for example
    /// `|_, id| WashOrder::empty(WashOrderId::new(id))`); the dispatcher
    /// rehydrates it from history before handling the command, so it never
    /// needs to know how aggregates are constructed.
    ///
    /// Returns the committed `StoredEvent`s with their assigned sequence
    /// numbers. An empty vector means the command was a no-op (the aggregate
    /// decided nothing needs to happen, e.g. a counter advance for an order
    /// that is already counted); no append and no publication take place.
    ///
    /// On a concurrency loss the caller decides whether to re-read and
    /// report, or to retry the whole dispatch; nothing is retried here.
    pub fn dispatch<A>(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(SiteId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: sudspoint_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history (site-scoped)
        let history = self.store.load_stream(site_id, aggregate_id)?;
        validate_loaded_stream(site_id, aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(site_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    site_id,
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // 5) Publish committed events (after append)
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    site_id: SiteId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Enforce site isolation even if a buggy backend returns cross-site data.
    // Also ensure the stream is monotonically increasing by sequence number.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.site_id != site_id {
            return Err(DispatchError::SiteIsolation(format!(
                "loaded stream contains wrong site_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::SiteIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

pub(crate) fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // Ensure deterministic ordering.
    let mut sorted = history.to_vec();
    sorted.sort_by_key(|e| e.sequence_number);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
