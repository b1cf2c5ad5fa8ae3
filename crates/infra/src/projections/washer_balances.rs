//! Washer balances read model.
//!
//! Keeps the raw commission entry log per `(site, washer)` and folds it at
//! query time, so one projection answers "all time", "this week" and any
//! other window without storing a running total per window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use sudspoint_commissions::CommissionLedgerEvent;
use sudspoint_core::{Money, SiteId, WasherId};
use sudspoint_events::EventEnvelope;
use sudspoint_orders::WashOrderId;

use crate::projections::ProjectionError;
use crate::projections::cursor_store::{InMemoryCursorStore, ProjectionCursorStore, ProjectionCursors};
use crate::read_model::SiteStore;

/// One commission entry as the balances read model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEntry {
    pub order_id: WashOrderId,
    pub total: Money,
    pub commission_amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Append-only per-washer entry log for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasherEntryLog {
    pub washer_id: WasherId,
    pub washer_code: String,
    pub entries: Vec<BalanceEntry>,
}

/// Balance folded over a time window.
///
/// Zero-value entries from free washes count towards `total_orders` but add
/// nothing to the money totals, so a washer's order count stays honest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasherBalance {
    pub washer_id: WasherId,
    pub washer_code: Option<String>,
    pub total_orders: u32,
    pub total_sales: Money,
    pub total_commission: Money,
}

impl WasherBalance {
    /// The balance of a washer with no entries (also used for unknown washers).
    pub fn zero(washer_id: WasherId) -> Self {
        Self {
            washer_id,
            washer_code: None,
            total_orders: 0,
            total_sales: Money::ZERO,
            total_commission: Money::ZERO,
        }
    }
}

/// Washer balances projection: consumes commission ledger events and keeps
/// the per-washer entry log. Rebuildable and site-isolated.
#[derive(Debug)]
pub struct WasherBalancesProjection<S, C = InMemoryCursorStore>
where
    S: SiteStore<WasherId, WasherEntryLog>,
{
    store: S,
    cursors: ProjectionCursors<C>,
}

impl<S> WasherBalancesProjection<S>
where
    S: SiteStore<WasherId, WasherEntryLog>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::new("commissions.washer_balances"),
        }
    }
}

impl<S, C> WasherBalancesProjection<S, C>
where
    S: SiteStore<WasherId, WasherEntryLog>,
    C: ProjectionCursorStore + 'static,
{
    pub fn with_persistent_cursors(store: S, cursor_store: Arc<C>) -> Self {
        Self {
            store,
            cursors: ProjectionCursors::with_store("commissions.washer_balances", cursor_store),
        }
    }

    /// Fold a washer's entry log over the half-open window `[from, to)`.
    ///
    /// `None` bounds are open ends. Unknown washers yield the zero balance.
    pub fn balance(
        &self,
        site_id: SiteId,
        washer_id: WasherId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> WasherBalance {
        let Some(log) = self.store.get(site_id, &washer_id) else {
            return WasherBalance::zero(washer_id);
        };

        let mut balance = WasherBalance {
            washer_id,
            washer_code: Some(log.washer_code.clone()),
            total_orders: 0,
            total_sales: Money::ZERO,
            total_commission: Money::ZERO,
        };
        for entry in &log.entries {
            if from.is_some_and(|f| entry.occurred_at < f) {
                continue;
            }
            if to.is_some_and(|t| entry.occurred_at >= t) {
                continue;
            }
            balance.total_orders += 1;
            balance.total_sales = balance.total_sales.saturating_add(entry.total);
            balance.total_commission = balance
                .total_commission
                .saturating_add(entry.commission_amount);
        }
        balance
    }

    /// All-time balances for every washer with at least one entry.
    pub fn list(&self, site_id: SiteId) -> Vec<WasherBalance> {
        self.store
            .list(site_id)
            .into_iter()
            .map(|log| {
                let mut balance = WasherBalance {
                    washer_id: log.washer_id,
                    washer_code: Some(log.washer_code.clone()),
                    total_orders: 0,
                    total_sales: Money::ZERO,
                    total_commission: Money::ZERO,
                };
                for entry in &log.entries {
                    balance.total_orders += 1;
                    balance.total_sales = balance.total_sales.saturating_add(entry.total);
                    balance.total_commission = balance
                        .total_commission
                        .saturating_add(entry.commission_amount);
                }
                balance
            })
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != "commissions.ledger" {
            return Ok(());
        }

        let site_id = envelope.site_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        if !self.cursors.admit(site_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: CommissionLedgerEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let CommissionLedgerEvent::EntryAppended(e) = ev;
        if e.site_id != site_id {
            return Err(ProjectionError::SiteIsolation(
                "event site_id does not match envelope site_id".to_string(),
            ));
        }
        if e.ledger_id.0 != aggregate_id {
            return Err(ProjectionError::SiteIsolation(
                "event ledger_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let mut log = self
            .store
            .get(site_id, &e.washer_id)
            .unwrap_or_else(|| WasherEntryLog {
                washer_id: e.washer_id,
                washer_code: e.washer_code.clone(),
                entries: vec![],
            });
        log.washer_code = e.washer_code;
        log.entries.push(BalanceEntry {
            order_id: e.order_id,
            total: e.total,
            commission_amount: e.commission_amount,
            occurred_at: e.occurred_at,
        });
        self.store.upsert(site_id, e.washer_id, log);

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
