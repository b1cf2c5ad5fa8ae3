use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use sudspoint_core::{Money, Plate, SiteId};
use sudspoint_events::EventEnvelope;
use sudspoint_orders::{PaymentMethod, WashOrderEvent, WashOrderId, WashOrderStatus};
use sudspoint_pricing::{VehicleClass, WashKind};

use crate::projections::ProjectionError;
use crate::projections::cursor_store::{InMemoryCursorStore, ProjectionCursorStore, ProjectionCursors};
use crate::read_model::SiteStore;

/// Counter-facing view of one wash order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReadModel {
    pub order_id: WashOrderId,
    pub plate: Plate,
    pub vehicle_class: VehicleClass,
    pub wash_kind: WashKind,
    pub status: WashOrderStatus,
    pub total: Money,
    pub is_free_wash: bool,
    pub cycle_position: u8,
    pub washer_code: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
    pub charged_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

/// Orders read model: one row per wash order, updated from order events.
#[derive(Debug)]
pub struct WashOrdersProjection<S, C = InMemoryCursorStore>
where
    S: SiteStore<WashOrderId, OrderReadModel>,
{
    store: S,
    cursors: ProjectionCursors<C>,
}

impl<S> WashOrdersProjection<S>
where
    S: SiteStore<WashOrderId, OrderReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::new("orders.wash_orders"),
        }
    }
}

impl<S, C> WashOrdersProjection<S, C>
where
    S: SiteStore<WashOrderId, OrderReadModel>,
    C: ProjectionCursorStore + 'static,
{
    pub fn with_persistent_cursors(store: S, cursor_store: Arc<C>) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::with_store("orders.wash_orders", cursor_store),
        }
    }

    pub fn get(&self, site_id: SiteId, order_id: &WashOrderId) -> Option<OrderReadModel> {
        self.store.get(site_id, order_id)
    }

    pub fn list(&self, site_id: SiteId) -> Vec<OrderReadModel> {
        self.store.list(site_id)
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != "orders.wash_order" {
            return Ok(());
        }

        let site_id = envelope.site_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        if !self.cursors.admit(site_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: WashOrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_site, order_id) = match &ev {
            WashOrderEvent::OrderCreated(e) => (e.site_id, e.order_id),
            WashOrderEvent::ChargeStarted(e) => (e.site_id, e.order_id),
            WashOrderEvent::OrderCharged(e) => (e.site_id, e.order_id),
            WashOrderEvent::OrderCancelled(e) => (e.site_id, e.order_id),
        };
        if event_site != site_id {
            return Err(ProjectionError::SiteIsolation(
                "event site_id does not match envelope site_id".to_string(),
            ));
        }
        if order_id.0 != aggregate_id {
            return Err(ProjectionError::SiteIsolation(
                "event order_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            WashOrderEvent::OrderCreated(e) => {
                self.store.upsert(
                    site_id,
                    e.order_id,
                    OrderReadModel {
                        order_id: e.order_id,
                        plate: e.plate,
                        vehicle_class: e.vehicle_class,
                        wash_kind: e.wash_kind,
                        status: WashOrderStatus::Pending,
                        total: e.total,
                        is_free_wash: e.is_free_wash,
                        cycle_position: e.cycle_position,
                        washer_code: None,
                        payment_method: None,
                        created_at: e.occurred_at,
                        charged_at: None,
                        cancel_reason: None,
                    },
                );
            }
            // The marker carries nothing the row shows; only the cursor moves.
            WashOrderEvent::ChargeStarted(_) => {}
            WashOrderEvent::OrderCharged(e) => {
                // The creation row must land first; without it there is
                // nothing to update, and leaving the cursor behind lets a
                // rebuild repair the row.
                let Some(mut rm) = self.store.get(site_id, &e.order_id) else {
                    return Ok(());
                };
                rm.status = WashOrderStatus::Charged;
                rm.washer_code = Some(e.washer_code);
                rm.payment_method = Some(e.payment_method);
                rm.charged_at = Some(e.occurred_at);
                self.store.upsert(site_id, e.order_id, rm);
            }
            WashOrderEvent::OrderCancelled(e) => {
                let Some(mut rm) = self.store.get(site_id, &e.order_id) else {
                    return Ok(());
                };
                rm.status = WashOrderStatus::Cancelled;
                rm.cancel_reason = e.reason;
                self.store.upsert(site_id, e.order_id, rm);
            }
        }

        self.cursors.advance(site_id, aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        {
            let mut sites = envs.iter().map(|e| e.site_id()).collect::<Vec<_>>();
            sites.sort_by_key(|s| *s.as_uuid().as_bytes());
            sites.dedup();
            for site in sites {
                self.store.clear_site(site);
                self.cursors.clear_site(site);
            }
        }

        envs.sort_by_key(|e| {
            (
                *e.site_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
