//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Site-isolated**: Data is partitioned by site
//! - **Idempotent**: Safe for at-least-once delivery

pub mod cursor_store;

pub mod site_revenue;
pub mod wash_orders;
pub mod washer_balances;

pub use cursor_store::{InMemoryCursorStore, ProjectionCursorStore, ProjectionCursors};
pub use site_revenue::{SiteRevenue, SiteRevenueProjection};
pub use wash_orders::{OrderReadModel, WashOrdersProjection};
pub use washer_balances::{BalanceEntry, WasherBalance, WasherBalancesProjection, WasherEntryLog};

/// Shared failure type for projection updates.
///
/// A sequence gap means the feed skipped an event for a stream this
/// projection already tracks; the fix is a rebuild, not a retry.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event payload: {0}")]
    Deserialize(String),
    #[error("site isolation violation: {0}")]
    SiteIsolation(String),
    #[error("non-monotonic sequence: last applied {last}, got {found}")]
    NonMonotonicSequence { last: u64, found: u64 },
}
