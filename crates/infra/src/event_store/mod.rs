//! Append-only event store boundary.
//!
//! Storage abstraction for site-scoped event streams. Nothing here assumes a
//! particular backend; the engine only relies on the append CAS.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Ordering invariant: publish happens only after append succeeds, so a
/// subscriber can never observe an event the store does not hold.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: sudspoint_events::EventBus<sudspoint_events::EventEnvelope<serde_json::Value>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: sudspoint_core::ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append(events, expected_version)?;

        // 2) Publish committed events (at-least-once acceptable)
        for e in &committed {
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        site_id: sudspoint_core::SiteId,
        aggregate_id: sudspoint_core::AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(site_id, aggregate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use sudspoint_core::{AggregateId, ExpectedVersion, SiteId};
    use sudspoint_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use sudspoint_orders::WashOrderId;
    use sudspoint_vehicles::{PaidWashCounted, VehicleEvent, VehicleLedgerId};

    fn counted(site_id: SiteId, ledger_id: VehicleLedgerId, n: u32) -> UncommittedEvent {
        let event = VehicleEvent::PaidWashCounted(PaidWashCounted {
            site_id,
            ledger_id,
            order_id: WashOrderId::new(AggregateId::new()),
            new_count: n,
            occurred_at: Utc::now(),
        });
        UncommittedEvent::from_typed(
            site_id,
            ledger_id.0,
            "vehicles.ledger",
            uuid::Uuid::now_v7(),
            &event,
        )
        .unwrap()
    }

    #[test]
    fn append_publishes_the_committed_events_in_stream_order() {
        let bus: InMemoryEventBus<EventEnvelope<serde_json::Value>> = InMemoryEventBus::new();
        let subscription = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus);

        let site_id = SiteId::new();
        let ledger_id = VehicleLedgerId::new(AggregateId::new());
        store
            .append(
                vec![
                    counted(site_id, ledger_id, 1),
                    counted(site_id, ledger_id, 2),
                ],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let first = subscription.try_recv().unwrap();
        let second = subscription.try_recv().unwrap();
        assert_eq!(first.sequence_number(), 1);
        assert_eq!(second.sequence_number(), 2);
        assert_eq!(first.aggregate_type(), "vehicles.ledger");
        assert!(subscription.try_recv().is_err());
    }

    #[test]
    fn failed_concurrency_check_publishes_nothing() {
        let bus: InMemoryEventBus<EventEnvelope<serde_json::Value>> = InMemoryEventBus::new();
        let subscription = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus);

        let site_id = SiteId::new();
        let ledger_id = VehicleLedgerId::new(AggregateId::new());
        let result = store.append(
            vec![counted(site_id, ledger_id, 1)],
            ExpectedVersion::Exact(3),
        );

        assert!(matches!(result, Err(EventStoreError::Concurrency(_))));
        assert!(subscription.try_recv().is_err());
    }
}
