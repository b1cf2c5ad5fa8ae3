use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sudspoint_core::{
    Aggregate, AggregateId, AggregateRoot, CommissionRate, DomainError, Money, SiteId, WasherId,
};
use sudspoint_events::Event;
use sudspoint_orders::WashOrderId;

/// Commission ledger identifier (one ledger stream per site).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionLedgerId(pub AggregateId);

impl CommissionLedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// The site's ledger stream reuses the site's own UUID, so any process
    /// finds it without a registry.
    pub fn for_site(site_id: &SiteId) -> Self {
        Self(AggregateId::from_uuid(*site_id.as_uuid()))
    }
}

impl core::fmt::Display for CommissionLedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One appended commission record (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEntry {
    pub order_id: WashOrderId,
    pub washer_id: WasherId,
    pub washer_code: String,
    pub total: Money,
    pub rate: CommissionRate,
    pub commission_amount: Money,
    pub business_share: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Aggregate root: CommissionLedger (append-only, one per site).
///
/// The ledger stream auto-creates on its first entry; there is no separate
/// open command. Entries are keyed by order id: exactly one entry may ever
/// exist per charged order, including zero-value entries for free washes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionLedger {
    id: CommissionLedgerId,
    site_id: Option<SiteId>,
    entries: Vec<CommissionEntry>,
    orders_with_entries: HashSet<WashOrderId>,
    total_sales: Money,
    total_commission: Money,
    total_business_share: Money,
    version: u64,
    created: bool,
}

impl CommissionLedger {
    /// Empty aggregate for rehydration.
    pub fn empty(id: CommissionLedgerId) -> Self {
        Self {
            id,
            site_id: None,
            entries: Vec::new(),
            orders_with_entries: HashSet::new(),
            total_sales: Money::ZERO,
            total_commission: Money::ZERO,
            total_business_share: Money::ZERO,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CommissionLedgerId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn entries(&self) -> &[CommissionEntry] {
        &self.entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_entry_for(&self, order_id: WashOrderId) -> bool {
        self.orders_with_entries.contains(&order_id)
    }

    /// The entry recorded for an order, if any. At most one can exist.
    pub fn entry_for(&self, order_id: WashOrderId) -> Option<&CommissionEntry> {
        self.entries.iter().find(|entry| entry.order_id == order_id)
    }

    pub fn total_sales(&self) -> Money {
        self.total_sales
    }

    pub fn total_commission(&self) -> Money {
        self.total_commission
    }

    pub fn total_business_share(&self) -> Money {
        self.total_business_share
    }
}

impl AggregateRoot for CommissionLedger {
    type Id = CommissionLedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AppendEntry.
///
/// Carries the raw total and rate; the ledger computes the split itself so an
/// entry can never be appended with shares that do not reconstruct the total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntry {
    pub site_id: SiteId,
    pub ledger_id: CommissionLedgerId,
    pub order_id: WashOrderId,
    pub washer_id: WasherId,
    pub washer_code: String,
    pub total: Money,
    pub rate: CommissionRate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionLedgerCommand {
    AppendEntry(AppendEntry),
}

/// Event: EntryAppended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAppended {
    pub site_id: SiteId,
    pub ledger_id: CommissionLedgerId,
    pub order_id: WashOrderId,
    pub washer_id: WasherId,
    pub washer_code: String,
    pub total: Money,
    pub rate: CommissionRate,
    pub commission_amount: Money,
    pub business_share: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionLedgerEvent {
    EntryAppended(EntryAppended),
}

impl Event for CommissionLedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CommissionLedgerEvent::EntryAppended(_) => "commissions.ledger.entry_appended",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CommissionLedgerEvent::EntryAppended(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CommissionLedger {
    type Command = CommissionLedgerCommand;
    type Event = CommissionLedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CommissionLedgerEvent::EntryAppended(e) => {
                self.id = e.ledger_id;
                if self.site_id.is_none() {
                    self.site_id = Some(e.site_id);
                    self.created = true;
                }
                self.orders_with_entries.insert(e.order_id);
                self.total_sales = self.total_sales.saturating_add(e.total);
                self.total_commission = self.total_commission.saturating_add(e.commission_amount);
                self.total_business_share =
                    self.total_business_share.saturating_add(e.business_share);
                self.entries.push(CommissionEntry {
                    order_id: e.order_id,
                    washer_id: e.washer_id,
                    washer_code: e.washer_code.clone(),
                    total: e.total,
                    rate: e.rate,
                    commission_amount: e.commission_amount,
                    business_share: e.business_share,
                    occurred_at: e.occurred_at,
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CommissionLedgerCommand::AppendEntry(cmd) => self.handle_append(cmd),
        }
    }
}

impl CommissionLedger {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::consistency("site mismatch"));
        }
        Ok(())
    }

    fn handle_append(&self, cmd: &AppendEntry) -> Result<Vec<CommissionLedgerEvent>, DomainError> {
        self.ensure_site(cmd.site_id)?;

        if self.id != cmd.ledger_id {
            return Err(DomainError::consistency("ledger_id mismatch"));
        }

        if self.orders_with_entries.contains(&cmd.order_id) {
            return Err(DomainError::duplicate(format!(
                "commission entry for order {} already exists",
                cmd.order_id
            )));
        }

        if cmd.washer_code.trim().is_empty() {
            return Err(DomainError::validation("washer code cannot be empty"));
        }

        let split = cmd.rate.split(cmd.total);

        Ok(vec![CommissionLedgerEvent::EntryAppended(EntryAppended {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            order_id: cmd.order_id,
            washer_id: cmd.washer_id,
            washer_code: cmd.washer_code.clone(),
            total: cmd.total,
            rate: cmd.rate,
            commission_amount: split.commission,
            business_share: split.business_share,
            occurred_at: cmd.occurred_at,
        })])
    }
}
