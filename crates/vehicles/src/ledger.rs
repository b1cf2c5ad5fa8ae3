use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sudspoint_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Plate, SiteId};
use sudspoint_events::Event;
use sudspoint_orders::WashOrderId;

/// Visits per loyalty cycle. The last visit of a cycle is the free wash, so a
/// vehicle earns one free wash for every `CYCLE_LENGTH - 1` paid washes.
pub const CYCLE_LENGTH: u32 = 10;

/// Vehicle ledger identifier.
///
/// Derived deterministically from `(site, normalized plate)`, so every
/// process addresses the same stream for the same vehicle without a
/// plate-to-stream registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleLedgerId(pub AggregateId);

impl VehicleLedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn for_vehicle(site_id: &SiteId, plate: &Plate) -> Self {
        Self(AggregateId::derived(site_id, plate.as_str()))
    }
}

impl core::fmt::Display for VehicleLedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Snapshot of a vehicle's position in the loyalty cycle (read-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePosition {
    pub washes_paid_count: u32,
    pub free_washes_redeemed: u32,
    /// 1-indexed slot the *next* wash occupies (1..=10).
    pub next_position: u8,
    pub next_wash_is_free: bool,
}

/// Aggregate root: VehicleLedger (per-vehicle loyalty counters).
///
/// The cycle is defined over *visits* (paid washes + redeemed free washes):
/// the next wash's slot is `(visits % 10) + 1` and slot 10 is free. Paid
/// charges advance `washes_paid_count`; charging a free order records the
/// redemption and never touches the paid counter, which is why the wash after
/// a free one starts a fresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleLedger {
    id: VehicleLedgerId,
    site_id: Option<SiteId>,
    plate: Option<Plate>,
    washes_paid_count: u32,
    free_washes_redeemed: u32,
    counted_orders: HashSet<WashOrderId>,
    quarantined: bool,
    quarantine_reason: Option<String>,
    last_wash_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl VehicleLedger {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: VehicleLedgerId) -> Self {
        Self {
            id,
            site_id: None,
            plate: None,
            washes_paid_count: 0,
            free_washes_redeemed: 0,
            counted_orders: HashSet::new(),
            quarantined: false,
            quarantine_reason: None,
            last_wash_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> VehicleLedgerId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn plate(&self) -> Option<&Plate> {
        self.plate.as_ref()
    }

    pub fn washes_paid_count(&self) -> u32 {
        self.washes_paid_count
    }

    pub fn free_washes_redeemed(&self) -> u32 {
        self.free_washes_redeemed
    }

    pub fn is_registered(&self) -> bool {
        self.created
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine_reason.as_deref()
    }

    pub fn last_wash_at(&self) -> Option<DateTime<Utc>> {
        self.last_wash_at
    }

    /// Whether a charge for this order already advanced the ledger.
    pub fn has_counted(&self, order_id: WashOrderId) -> bool {
        self.counted_orders.contains(&order_id)
    }

    /// Total visits so far: paid washes plus redeemed free washes.
    pub fn total_visits(&self) -> u32 {
        self.washes_paid_count + self.free_washes_redeemed
    }

    /// 1-indexed slot the next wash occupies (1..=10).
    pub fn next_position(&self) -> u8 {
        ((self.total_visits() % CYCLE_LENGTH) + 1) as u8
    }

    /// True when the next wash lands on the free slot of the cycle.
    pub fn next_wash_is_free(&self) -> bool {
        self.next_position() as u32 == CYCLE_LENGTH
    }

    /// Free washes earned so far (one per completed run of paid washes).
    pub fn free_washes_granted(&self) -> u32 {
        self.washes_paid_count / (CYCLE_LENGTH - 1)
    }

    /// Read-only snapshot of the loyalty counters.
    pub fn cycle_position(&self) -> CyclePosition {
        CyclePosition {
            washes_paid_count: self.washes_paid_count,
            free_washes_redeemed: self.free_washes_redeemed,
            next_position: self.next_position(),
            next_wash_is_free: self.next_wash_is_free(),
        }
    }
}

impl AggregateRoot for VehicleLedger {
    type Id = VehicleLedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterVehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterVehicle {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub plate: Plate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CountPaidWash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountPaidWash {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub order_id: WashOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RedeemFreeWash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemFreeWash {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub order_id: WashOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: QuarantineVehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineVehicle {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseVehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseVehicle {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleCommand {
    RegisterVehicle(RegisterVehicle),
    CountPaidWash(CountPaidWash),
    RedeemFreeWash(RedeemFreeWash),
    QuarantineVehicle(QuarantineVehicle),
    ReleaseVehicle(ReleaseVehicle),
}

/// Event: VehicleRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRegistered {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub plate: Plate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaidWashCounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidWashCounted {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub order_id: WashOrderId,
    pub new_count: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: FreeWashRedeemed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeWashRedeemed {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub order_id: WashOrderId,
    pub new_redeemed: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VehicleQuarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleQuarantined {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VehicleReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleReleased {
    pub site_id: SiteId,
    pub ledger_id: VehicleLedgerId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleEvent {
    VehicleRegistered(VehicleRegistered),
    PaidWashCounted(PaidWashCounted),
    FreeWashRedeemed(FreeWashRedeemed),
    VehicleQuarantined(VehicleQuarantined),
    VehicleReleased(VehicleReleased),
}

impl Event for VehicleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            VehicleEvent::VehicleRegistered(_) => "vehicles.ledger.registered",
            VehicleEvent::PaidWashCounted(_) => "vehicles.ledger.paid_wash_counted",
            VehicleEvent::FreeWashRedeemed(_) => "vehicles.ledger.free_wash_redeemed",
            VehicleEvent::VehicleQuarantined(_) => "vehicles.ledger.quarantined",
            VehicleEvent::VehicleReleased(_) => "vehicles.ledger.released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            VehicleEvent::VehicleRegistered(e) => e.occurred_at,
            VehicleEvent::PaidWashCounted(e) => e.occurred_at,
            VehicleEvent::FreeWashRedeemed(e) => e.occurred_at,
            VehicleEvent::VehicleQuarantined(e) => e.occurred_at,
            VehicleEvent::VehicleReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for VehicleLedger {
    type Command = VehicleCommand;
    type Event = VehicleEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            VehicleEvent::VehicleRegistered(e) => {
                self.id = e.ledger_id;
                self.site_id = Some(e.site_id);
                self.plate = Some(e.plate.clone());
                self.washes_paid_count = 0;
                self.free_washes_redeemed = 0;
                self.created = true;
            }
            VehicleEvent::PaidWashCounted(e) => {
                self.washes_paid_count = e.new_count;
                self.counted_orders.insert(e.order_id);
                self.last_wash_at = Some(e.occurred_at);
            }
            VehicleEvent::FreeWashRedeemed(e) => {
                self.free_washes_redeemed = e.new_redeemed;
                self.counted_orders.insert(e.order_id);
                self.last_wash_at = Some(e.occurred_at);
            }
            VehicleEvent::VehicleQuarantined(e) => {
                self.quarantined = true;
                self.quarantine_reason = Some(e.reason.clone());
            }
            VehicleEvent::VehicleReleased(_) => {
                self.quarantined = false;
                self.quarantine_reason = None;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            VehicleCommand::RegisterVehicle(cmd) => self.handle_register(cmd),
            VehicleCommand::CountPaidWash(cmd) => self.handle_count(cmd),
            VehicleCommand::RedeemFreeWash(cmd) => self.handle_redeem(cmd),
            VehicleCommand::QuarantineVehicle(cmd) => self.handle_quarantine(cmd),
            VehicleCommand::ReleaseVehicle(cmd) => self.handle_release(cmd),
        }
    }
}

impl VehicleLedger {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::consistency("site mismatch"));
        }
        Ok(())
    }

    fn ensure_ledger_id(&self, ledger_id: VehicleLedgerId) -> Result<(), DomainError> {
        if self.id != ledger_id {
            return Err(DomainError::consistency("ledger_id mismatch"));
        }
        Ok(())
    }

    fn ensure_chargeable(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.quarantined {
            return Err(DomainError::consistency(format!(
                "vehicle ledger is quarantined: {}",
                self.quarantine_reason.as_deref().unwrap_or("no reason recorded")
            )));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterVehicle) -> Result<Vec<VehicleEvent>, DomainError> {
        if self.created {
            return Err(DomainError::duplicate("vehicle is already registered"));
        }

        // The stream id must be the one derived from the plate, otherwise two
        // spellings of a plate could split one vehicle across streams.
        if VehicleLedgerId::for_vehicle(&cmd.site_id, &cmd.plate) != cmd.ledger_id {
            return Err(DomainError::validation(
                "ledger id does not match the plate it registers",
            ));
        }

        Ok(vec![VehicleEvent::VehicleRegistered(VehicleRegistered {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            plate: cmd.plate.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_count(&self, cmd: &CountPaidWash) -> Result<Vec<VehicleEvent>, DomainError> {
        self.ensure_chargeable()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_ledger_id(cmd.ledger_id)?;

        // Idempotent per order: a resumed charge must not double-count.
        if self.counted_orders.contains(&cmd.order_id) {
            return Ok(vec![]);
        }

        Ok(vec![VehicleEvent::PaidWashCounted(PaidWashCounted {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            order_id: cmd.order_id,
            new_count: self.washes_paid_count + 1,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_redeem(&self, cmd: &RedeemFreeWash) -> Result<Vec<VehicleEvent>, DomainError> {
        self.ensure_chargeable()?;
        self.ensure_site(cmd.site_id)?;
        self.ensure_ledger_id(cmd.ledger_id)?;

        if self.counted_orders.contains(&cmd.order_id) {
            return Ok(vec![]);
        }

        Ok(vec![VehicleEvent::FreeWashRedeemed(FreeWashRedeemed {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            order_id: cmd.order_id,
            new_redeemed: self.free_washes_redeemed + 1,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_quarantine(&self, cmd: &QuarantineVehicle) -> Result<Vec<VehicleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_ledger_id(cmd.ledger_id)?;

        if self.quarantined {
            return Err(DomainError::invalid_state("vehicle is already quarantined"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("quarantine reason cannot be empty"));
        }

        Ok(vec![VehicleEvent::VehicleQuarantined(VehicleQuarantined {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseVehicle) -> Result<Vec<VehicleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_ledger_id(cmd.ledger_id)?;

        if !self.quarantined {
            return Err(DomainError::invalid_state("vehicle is not quarantined"));
        }

        Ok(vec![VehicleEvent::VehicleReleased(VehicleReleased {
            site_id: cmd.site_id,
            ledger_id: cmd.ledger_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
