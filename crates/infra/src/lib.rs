//! Infrastructure layer: event store, command dispatch, projections and the
//! wash engine that wires the domain crates together.
//!
//! Everything here is deployment plumbing; business rules live in the domain
//! crates. The layer is trait-based (`EventStore`, `EventBus`, `SiteStore`),
//! so the same engine runs against in-memory implementations in tests and
//! benches and against real backends in production.

pub mod command_dispatcher;
pub mod engine;
pub mod event_store;
pub mod projections;
pub mod read_model;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use engine::{
    ChargeReceipt, EngineError, NewOrder, ProjectionSet, WashEngine, spawn_projection_feed,
};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore, StoredEvent,
    UncommittedEvent,
};
pub use read_model::{InMemorySiteStore, SiteStore};
