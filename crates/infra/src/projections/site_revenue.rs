//! Per-site revenue rollup.
//!
//! One row per site: charged order count, free wash count and the money
//! totals. Only `OrderCharged` moves the numbers; every other order event
//! passes through so the cursor still advances.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use sudspoint_core::{Money, SiteId};
use sudspoint_events::EventEnvelope;
use sudspoint_orders::WashOrderEvent;

use crate::projections::ProjectionError;
use crate::projections::cursor_store::{InMemoryCursorStore, ProjectionCursorStore, ProjectionCursors};
use crate::read_model::SiteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRevenue {
    pub site_id: SiteId,
    pub orders_charged: u32,
    pub free_washes: u32,
    pub gross_sales: Money,
    pub commission_total: Money,
    pub business_share_total: Money,
}

impl SiteRevenue {
    pub fn zero(site_id: SiteId) -> Self {
        Self {
            site_id,
            orders_charged: 0,
            free_washes: 0,
            gross_sales: Money::ZERO,
            commission_total: Money::ZERO,
            business_share_total: Money::ZERO,
        }
    }
}

/// Site revenue projection over wash order events. Rebuildable, idempotent.
#[derive(Debug)]
pub struct SiteRevenueProjection<S, C = InMemoryCursorStore>
where
    S: SiteStore<SiteId, SiteRevenue>,
{
    store: S,
    cursors: ProjectionCursors<C>,
}

impl<S> SiteRevenueProjection<S>
where
    S: SiteStore<SiteId, SiteRevenue>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::new("orders.site_revenue"),
        }
    }
}

impl<S, C> SiteRevenueProjection<S, C>
where
    S: SiteStore<SiteId, SiteRevenue>,
    C: ProjectionCursorStore + 'static,
{
    pub fn with_persistent_cursors(store: S, cursor_store: Arc<C>) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::with_store("orders.site_revenue", cursor_store),
        }
    }

    pub fn summary(&self, site_id: SiteId) -> SiteRevenue {
        self.store
            .get(site_id, &site_id)
            .unwrap_or_else(|| SiteRevenue::zero(site_id))
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

        if let WashOrderEvent::OrderCharged(e) = ev {
            if e.site_id != site_id {
                return Err(ProjectionError::SiteIsolation(
                    "event site_id does not match envelope site_id".to_string(),
                ));
            }

            let mut revenue = self
                .store
                .get(site_id, &site_id)
                .unwrap_or_else(|| SiteRevenue::zero(site_id));
            revenue.orders_charged += 1;
            if e.total.is_zero() {
                revenue.free_washes += 1;
            }
            revenue.gross_sales = revenue.gross_sales.saturating_add(e.total);
            revenue.commission_total = revenue
                .commission_total
                .saturating_add(e.commission_amount);
            revenue.business_share_total = revenue
                .business_share_total
                .saturating_add(e.business_share);
            self.store.upsert(site_id, site_id, revenue);
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
