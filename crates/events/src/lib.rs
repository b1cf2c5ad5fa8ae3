//! Event contracts and transport.
//!
//! Defines the [`Event`] trait domain crates implement, the site-scoped
//! [`EventEnvelope`] the store persists, and the [`EventBus`] abstraction that
//! feeds read models.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
