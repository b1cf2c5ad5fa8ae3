use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sudspoint_core::{
    Aggregate, AggregateId, AggregateRoot, CommissionRate, CommissionSplit, DomainError, Money,
    Plate, SiteId, WasherId,
};
use sudspoint_events::Event;
use sudspoint_pricing::{VehicleClass, WashKind};

/// Slot count of the loyalty cycle; an order in the last slot is free.
pub const FREE_WASH_POSITION: u8 = 10;

/// Wash order identifier (site-scoped via `site_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WashOrderId(pub AggregateId);

impl WashOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for WashOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// How the customer settled the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
}

/// Order lifecycle. `Charged` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WashOrderStatus {
    Pending,
    Charged,
    Cancelled,
}

/// Aggregate root: WashOrder.
///
/// The free-wash decision (`is_free_wash` + `cycle_position`) is pinned at
/// creation from the vehicle ledger's counters at that instant and never
/// re-derived, even if the ledger moves before the order is charged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WashOrder {
    id: WashOrderId,
    site_id: Option<SiteId>,
    plate: Option<Plate>,
    vehicle_class: Option<VehicleClass>,
    wash_kind: Option<WashKind>,
    total: Money,
    is_free_wash: bool,
    cycle_position: u8,
    status: WashOrderStatus,
    charge_begun: bool,
    washer_id: Option<WasherId>,
    washer_code: Option<String>,
    payment_method: Option<PaymentMethod>,
    amount_received: Option<Money>,
    change_due: Option<Money>,
    commission: Option<CommissionSplit>,
    charged_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl WashOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: WashOrderId) -> Self {
        Self {
            id,
            site_id: None,
            plate: None,
            vehicle_class: None,
            wash_kind: None,
            total: Money::ZERO,
            is_free_wash: false,
            cycle_position: 0,
            status: WashOrderStatus::Pending,
            charge_begun: false,
            washer_id: None,
            washer_code: None,
            payment_method: None,
            amount_received: None,
            change_due: None,
            commission: None,
            charged_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> WashOrderId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn plate(&self) -> Option<&Plate> {
        self.plate.as_ref()
    }

    pub fn vehicle_class(&self) -> Option<&VehicleClass> {
        self.vehicle_class.as_ref()
    }

    pub fn wash_kind(&self) -> Option<&WashKind> {
        self.wash_kind.as_ref()
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn is_free_wash(&self) -> bool {
        self.is_free_wash
    }

    pub fn cycle_position(&self) -> u8 {
        self.cycle_position
    }

    pub fn status(&self) -> WashOrderStatus {
        self.status
    }

    /// Whether a charge has been pinned onto this order's stream. Set by the
    /// `ChargeStarted` marker and never cleared; once true, the only way
    /// forward is `Charged`.
    pub fn charge_begun(&self) -> bool {
        self.charge_begun
    }

    pub fn washer_id(&self) -> Option<WasherId> {
        self.washer_id
    }

    pub fn washer_code(&self) -> Option<&str> {
        self.washer_code.as_deref()
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    pub fn amount_received(&self) -> Option<Money> {
        self.amount_received
    }

    pub fn change_due(&self) -> Option<Money> {
        self.change_due
    }

    pub fn commission(&self) -> Option<&CommissionSplit> {
        self.commission.as_ref()
    }

    pub fn charged_at(&self) -> Option<DateTime<Utc>> {
        self.charged_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for WashOrder {
    type Id = WashOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
///
/// `total`, `is_free_wash` and `cycle_position` have already been resolved by
/// the caller (price table + vehicle ledger read); the aggregate cross-checks
/// them for coherence and pins them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub plate: Plate,
    pub vehicle_class: VehicleClass,
    pub wash_kind: WashKind,
    pub total: Money,
    pub is_free_wash: bool,
    pub cycle_position: u8,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BeginCharge.
///
/// Written to the order's own stream before any cross-stream side effect of
/// the charge, so a concurrent cancel serializes against it: a cancel that
/// commits first makes the marker lose its version check, and once the marker
/// is on the stream the order refuses cancellation. Re-issuing it on an order
/// that already began charging commits nothing, which is how an interrupted
/// charge resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginCharge {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChargeOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeOrder {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub washer_id: WasherId,
    pub washer_code: String,
    pub payment_method: PaymentMethod,
    pub amount_received: Money,
    pub commission_rate: CommissionRate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WashOrderCommand {
    CreateOrder(CreateOrder),
    BeginCharge(BeginCharge),
    ChargeOrder(ChargeOrder),
    CancelOrder(CancelOrder),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub plate: Plate,
    pub vehicle_class: VehicleClass,
    pub wash_kind: WashKind,
    pub total: Money,
    pub is_free_wash: bool,
    pub cycle_position: u8,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ChargeStarted. The serialization marker for the charge flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeStarted {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCharged.
///
/// Carries the full commission split so downstream consumers never have to
/// recompute it (the split recorded here and the ledger entry must agree).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCharged {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub washer_id: WasherId,
    pub washer_code: String,
    pub payment_method: PaymentMethod,
    pub total: Money,
    pub amount_received: Money,
    pub change_due: Money,
    pub commission_rate: CommissionRate,
    pub commission_amount: Money,
    pub business_share: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub site_id: SiteId,
    pub order_id: WashOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WashOrderEvent {
    OrderCreated(OrderCreated),
    ChargeStarted(ChargeStarted),
    OrderCharged(OrderCharged),
    OrderCancelled(OrderCancelled),
}

impl Event for WashOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WashOrderEvent::OrderCreated(_) => "orders.wash_order.created",
            WashOrderEvent::ChargeStarted(_) => "orders.wash_order.charge_started",
            WashOrderEvent::OrderCharged(_) => "orders.wash_order.charged",
            WashOrderEvent::OrderCancelled(_) => "orders.wash_order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WashOrderEvent::OrderCreated(e) => e.occurred_at,
            WashOrderEvent::ChargeStarted(e) => e.occurred_at,
            WashOrderEvent::OrderCharged(e) => e.occurred_at,
            WashOrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for WashOrder {
    type Command = WashOrderCommand;
    type Event = WashOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WashOrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.site_id = Some(e.site_id);
                self.plate = Some(e.plate.clone());
                self.vehicle_class = Some(e.vehicle_class.clone());
                self.wash_kind = Some(e.wash_kind.clone());
                self.total = e.total;
                self.is_free_wash = e.is_free_wash;
                self.cycle_position = e.cycle_position;
                self.status = WashOrderStatus::Pending;
                self.created = true;
            }
            WashOrderEvent::ChargeStarted(_) => {
                self.charge_begun = true;
            }
            WashOrderEvent::OrderCharged(e) => {
                self.status = WashOrderStatus::Charged;
                self.washer_id = Some(e.washer_id);
                self.washer_code = Some(e.washer_code.clone());
                self.payment_method = Some(e.payment_method);
                self.amount_received = Some(e.amount_received);
                self.change_due = Some(e.change_due);
                self.commission = Some(CommissionSplit {
                    total: e.total,
                    commission: e.commission_amount,
                    business_share: e.business_share,
                });
                self.charged_at = Some(e.occurred_at);
            }
            WashOrderEvent::OrderCancelled(_) => {
                self.status = WashOrderStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WashOrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            WashOrderCommand::BeginCharge(cmd) => self.handle_begin_charge(cmd),
            WashOrderCommand::ChargeOrder(cmd) => self.handle_charge(cmd),
            WashOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl WashOrder {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::consistency("site mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: WashOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::consistency("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<WashOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::duplicate("wash order already exists"));
        }

        if cmd.cycle_position < 1 || cmd.cycle_position > FREE_WASH_POSITION {
            return Err(DomainError::validation(format!(
                "cycle position must be between 1 and {FREE_WASH_POSITION}"
            )));
        }

        let position_is_free = cmd.cycle_position == FREE_WASH_POSITION;
        if cmd.is_free_wash != position_is_free {
            return Err(DomainError::validation(
                "free wash flag does not match cycle position",
            ));
        }

        if cmd.is_free_wash && !cmd.total.is_zero() {
            return Err(DomainError::validation("a free wash must have zero total"));
        }

        if !cmd.is_free_wash && cmd.total.is_zero() {
            return Err(DomainError::validation(
                "a paid wash must have a positive total",
            ));
        }

        Ok(vec![WashOrderEvent::OrderCreated(OrderCreated {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            plate: cmd.plate.clone(),
            vehicle_class: cmd.vehicle_class.clone(),
            wash_kind: cmd.wash_kind.clone(),
            total: cmd.total,
            is_free_wash: cmd.is_free_wash,
            cycle_position: cmd.cycle_position,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_begin_charge(&self, cmd: &BeginCharge) -> Result<Vec<WashOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            WashOrderStatus::Pending => {}
            WashOrderStatus::Charged => {
                return Err(DomainError::invalid_state("order is already charged"));
            }
            WashOrderStatus::Cancelled => {
                return Err(DomainError::invalid_state("order is cancelled"));
            }
        }

        if self.charge_begun {
            // The marker is already on the stream; this is a resumption.
            return Ok(Vec::new());
        }

        Ok(vec![WashOrderEvent::ChargeStarted(ChargeStarted {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_charge(&self, cmd: &ChargeOrder) -> Result<Vec<WashOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            WashOrderStatus::Pending => {}
            WashOrderStatus::Charged => {
                return Err(DomainError::invalid_state("order is already charged"));
            }
            WashOrderStatus::Cancelled => {
                return Err(DomainError::invalid_state("order is cancelled"));
            }
        }

        if !self.charge_begun {
            return Err(DomainError::invalid_state(
                "charge has not begun for this order",
            ));
        }

        if cmd.washer_code.trim().is_empty() {
            return Err(DomainError::validation("washer code cannot be empty"));
        }

        // Underpayment check and change computation in one step.
        let change_due = cmd.amount_received.checked_sub(self.total).ok_or_else(|| {
            DomainError::validation(format!(
                "amount received {} is less than order total {}",
                cmd.amount_received, self.total
            ))
        })?;

        let split = cmd.commission_rate.split(self.total);

        Ok(vec![WashOrderEvent::OrderCharged(OrderCharged {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            washer_id: cmd.washer_id,
            washer_code: cmd.washer_code.clone(),
            payment_method: cmd.payment_method,
            total: self.total,
            amount_received: cmd.amount_received,
            change_due,
            commission_rate: cmd.commission_rate,
            commission_amount: split.commission,
            business_share: split.business_share,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<WashOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            WashOrderStatus::Pending => {}
            WashOrderStatus::Charged => {
                return Err(DomainError::invalid_state("cannot cancel a charged order"));
            }
            WashOrderStatus::Cancelled => {
                return Err(DomainError::invalid_state("order is already cancelled"));
            }
        }

        // Once the charge marker exists, counter or commission effects may
        // already be on the other streams; the order can only move forward.
        if self.charge_begun {
            return Err(DomainError::invalid_state(
                "cannot cancel an order once charging has begun",
            ));
        }

        Ok(vec![WashOrderEvent::OrderCancelled(OrderCancelled {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sudspoint_core::AggregateId;

    fn test_site_id() -> SiteId {
        SiteId::new()
    }

    fn test_order_id() -> WashOrderId {
        WashOrderId::new(AggregateId::new())
    }

    fn test_washer_id() -> WasherId {
        WasherId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn create_cmd(site_id: SiteId, order_id: WashOrderId) -> CreateOrder {
        CreateOrder {
            site_id,
            order_id,
            plate: Plate::parse("AB123CD").unwrap(),
            vehicle_class: VehicleClass::new("sedan").unwrap(),
            wash_kind: WashKind::new("basic").unwrap(),
            total: Money::from_minor_units(15_000),
            is_free_wash: false,
            cycle_position: 3,
            occurred_at: test_time(),
        }
    }

    fn free_create_cmd(site_id: SiteId, order_id: WashOrderId) -> CreateOrder {
        CreateOrder {
            total: Money::ZERO,
            is_free_wash: true,
            cycle_position: FREE_WASH_POSITION,
            ..create_cmd(site_id, order_id)
        }
    }

    fn begin_cmd(site_id: SiteId, order_id: WashOrderId) -> BeginCharge {
        BeginCharge {
            site_id,
            order_id,
            occurred_at: test_time(),
        }
    }

    fn charge_cmd(site_id: SiteId, order_id: WashOrderId) -> ChargeOrder {
        ChargeOrder {
            site_id,
            order_id,
            washer_id: test_washer_id(),
            washer_code: "W-07".to_string(),
            payment_method: PaymentMethod::Cash,
            amount_received: Money::from_minor_units(15_000),
            commission_rate: CommissionRate::from_percent(40).unwrap(),
            occurred_at: test_time(),
        }
    }

    fn pending_order(site_id: SiteId, order_id: WashOrderId) -> WashOrder {
        let mut order = WashOrder::empty(order_id);
        let events = order
            .handle(&WashOrderCommand::CreateOrder(create_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        order
    }

    /// A pending order with the charge marker applied, as the charge flow
    /// leaves it right before any cross-stream side effect.
    fn charging_order(site_id: SiteId, order_id: WashOrderId) -> WashOrder {
        let mut order = pending_order(site_id, order_id);
        let events = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        order
    }

    #[test]
    fn create_order_emits_order_created_event() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = WashOrder::empty(order_id);

        let events = order
            .handle(&WashOrderCommand::CreateOrder(create_cmd(site_id, order_id)))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            WashOrderEvent::OrderCreated(e) => {
                assert_eq!(e.site_id, site_id);
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.total, Money::from_minor_units(15_000));
                assert!(!e.is_free_wash);
                assert_eq!(e.cycle_position, 3);
            }
            _ => panic!("Expected OrderCreated event"),
        }
    }

    #[test]
    fn creating_existing_order_is_a_duplicate() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = pending_order(site_id, order_id);

        let err = order
            .handle(&WashOrderCommand::CreateOrder(create_cmd(site_id, order_id)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Duplicate(_)));
    }

    #[test]
    fn create_rejects_free_flag_and_position_mismatch() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = WashOrder::empty(order_id);

        let mut cmd = create_cmd(site_id, order_id);
        cmd.is_free_wash = true; // position 3 says paid
        cmd.total = Money::ZERO;

        let err = order
            .handle(&WashOrderCommand::CreateOrder(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_nonzero_total_on_free_wash() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = WashOrder::empty(order_id);

        let mut cmd = free_create_cmd(site_id, order_id);
        cmd.total = Money::from_minor_units(100);

        let err = order
            .handle(&WashOrderCommand::CreateOrder(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_zero_total_on_paid_wash() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = WashOrder::empty(order_id);

        let mut cmd = create_cmd(site_id, order_id);
        cmd.total = Money::ZERO;

        let err = order
            .handle(&WashOrderCommand::CreateOrder(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn charge_pending_order_emits_charged_event_with_split() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = charging_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            WashOrderEvent::OrderCharged(e) => {
                assert_eq!(e.total, Money::from_minor_units(15_000));
                assert_eq!(e.commission_amount, Money::from_minor_units(6_000));
                assert_eq!(e.business_share, Money::from_minor_units(9_000));
                assert_eq!(e.change_due, Money::ZERO);
            }
            _ => panic!("Expected OrderCharged event"),
        }
    }

    #[test]
    fn charge_rejects_underpayment() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = charging_order(site_id, order_id);

        let mut cmd = charge_cmd(site_id, order_id);
        cmd.amount_received = Money::from_minor_units(14_999);

        let err = order
            .handle(&WashOrderCommand::ChargeOrder(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn overpayment_produces_change() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = charging_order(site_id, order_id);

        let mut cmd = charge_cmd(site_id, order_id);
        cmd.amount_received = Money::from_minor_units(20_000);

        let events = order.handle(&WashOrderCommand::ChargeOrder(cmd)).unwrap();
        match &events[0] {
            WashOrderEvent::OrderCharged(e) => {
                assert_eq!(e.change_due, Money::from_minor_units(5_000));
            }
            _ => panic!("Expected OrderCharged event"),
        }
    }

    #[test]
    fn charging_twice_is_an_invalid_state() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = charging_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.status(), WashOrderStatus::Charged);

        let err = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("already charged") => {}
            other => panic!("Expected InvalidState for double charge, got {other:?}"),
        }
    }

    #[test]
    fn cannot_charge_cancelled_order() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = pending_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);

        let err = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn free_order_charges_with_zero_received() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = WashOrder::empty(order_id);

        let events = order
            .handle(&WashOrderCommand::CreateOrder(free_create_cmd(
                site_id, order_id,
            )))
            .unwrap();
        order.apply(&events[0]);
        let events = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);

        let mut cmd = charge_cmd(site_id, order_id);
        cmd.amount_received = Money::ZERO;

        let events = order.handle(&WashOrderCommand::ChargeOrder(cmd)).unwrap();
        match &events[0] {
            WashOrderEvent::OrderCharged(e) => {
                assert_eq!(e.total, Money::ZERO);
                assert_eq!(e.commission_amount, Money::ZERO);
                assert_eq!(e.business_share, Money::ZERO);
                assert_eq!(e.change_due, Money::ZERO);
            }
            _ => panic!("Expected OrderCharged event"),
        }
    }

    #[test]
    fn cancel_pending_order_emits_cancelled_event() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = pending_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason: Some("customer left".to_string()),
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.status(), WashOrderStatus::Cancelled);
    }

    #[test]
    fn cannot_cancel_charged_order() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = charging_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);

        let err = order
            .handle(&WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = charging_order(site_id, order_id);

        let cmd = charge_cmd(site_id, order_id);
        let before_version = order.version();
        let before_status = order.status();

        let events1 = order
            .handle(&WashOrderCommand::ChargeOrder(cmd.clone()))
            .unwrap();
        let events2 = order
            .handle(&WashOrderCommand::ChargeOrder(cmd.clone()))
            .unwrap();

        assert_eq!(order.version(), before_version);
        assert_eq!(order.status(), before_status);
        assert_eq!(events1, events2);
    }

    #[test]
    fn apply_is_deterministic() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let created = WashOrderEvent::OrderCreated(OrderCreated {
            site_id,
            order_id,
            plate: Plate::parse("XY987Z").unwrap(),
            vehicle_class: VehicleClass::new("suv").unwrap(),
            wash_kind: WashKind::new("deluxe").unwrap(),
            total: Money::from_minor_units(4_000),
            is_free_wash: false,
            cycle_position: 7,
            occurred_at: test_time(),
        });
        let started = WashOrderEvent::ChargeStarted(ChargeStarted {
            site_id,
            order_id,
            occurred_at: test_time(),
        });
        let charged = WashOrderEvent::OrderCharged(OrderCharged {
            site_id,
            order_id,
            washer_id: test_washer_id(),
            washer_code: "W-01".to_string(),
            payment_method: PaymentMethod::Card,
            total: Money::from_minor_units(4_000),
            amount_received: Money::from_minor_units(4_000),
            change_due: Money::ZERO,
            commission_rate: CommissionRate::from_percent(33).unwrap(),
            commission_amount: Money::from_minor_units(1_320),
            business_share: Money::from_minor_units(2_680),
            occurred_at: test_time(),
        });

        let mut a = WashOrder::empty(order_id);
        a.apply(&created);
        a.apply(&started);
        a.apply(&charged);

        let mut b = WashOrder::empty(order_id);
        b.apply(&created);
        b.apply(&started);
        b.apply(&charged);

        assert_eq!(a.version(), b.version());
        assert_eq!(a.status(), b.status());
        assert_eq!(a.commission(), b.commission());
        assert_eq!(a.status(), WashOrderStatus::Charged);
    }

    #[test]
    fn version_increments_on_apply() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = WashOrder::empty(order_id);
        assert_eq!(order.version(), 0);

        let events = order
            .handle(&WashOrderCommand::CreateOrder(create_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.version(), 1);

        let events = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.version(), 2);

        let events = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap();
        order.apply(&events[0]);
        assert_eq!(order.version(), 3);
    }

    #[test]
    fn begin_charge_emits_the_marker_once_then_commits_empty() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = pending_order(site_id, order_id);
        assert!(!order.charge_begun());

        let events = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WashOrderEvent::ChargeStarted(_)));
        order.apply(&events[0]);
        assert!(order.charge_begun());
        assert_eq!(order.status(), WashOrderStatus::Pending);

        // Resumption: the marker is already on the stream.
        let events = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn begin_charge_on_cancelled_order_is_invalid() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let mut order = pending_order(site_id, order_id);

        let events = order
            .handle(&WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);

        let err = order
            .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn charge_requires_the_charging_marker() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = pending_order(site_id, order_id);

        let err = order
            .handle(&WashOrderCommand::ChargeOrder(charge_cmd(site_id, order_id)))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("has not begun") => {}
            other => panic!("Expected InvalidState for a charge without marker, got {other:?}"),
        }
    }

    #[test]
    fn cannot_cancel_once_charging_has_begun() {
        let site_id = test_site_id();
        let order_id = test_order_id();
        let order = charging_order(site_id, order_id);

        let err = order
            .handle(&WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason: Some("changed their mind".to_string()),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("charging has begun") => {}
            other => panic!("Expected InvalidState for cancel after marker, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any order total, received amount >= total and rate,
        /// the charged event's split reconstructs the total exactly and the
        /// change is the exact overpayment.
        #[test]
        fn charged_event_split_reconstructs_total(
            total in 1u64..10_000_000u64,
            extra in 0u64..1_000_000u64,
            bps in 0u16..=10_000u16,
        ) {
            let site_id = test_site_id();
            let order_id = test_order_id();

            let mut cmd = create_cmd(site_id, order_id);
            cmd.total = Money::from_minor_units(total);
            let mut order = WashOrder::empty(order_id);
            let events = order
                .handle(&WashOrderCommand::CreateOrder(cmd))
                .unwrap();
            order.apply(&events[0]);
            let events = order
                .handle(&WashOrderCommand::BeginCharge(begin_cmd(site_id, order_id)))
                .unwrap();
            order.apply(&events[0]);

            let mut charge = charge_cmd(site_id, order_id);
            charge.amount_received = Money::from_minor_units(total + extra);
            charge.commission_rate = CommissionRate::from_basis_points(bps).unwrap();

            let events = order
                .handle(&WashOrderCommand::ChargeOrder(charge))
                .unwrap();
            match &events[0] {
                WashOrderEvent::OrderCharged(e) => {
                    prop_assert_eq!(
                        e.commission_amount.checked_add(e.business_share),
                        Some(e.total)
                    );
                    prop_assert!(e.commission_amount <= e.total);
                    prop_assert_eq!(e.change_due, Money::from_minor_units(extra));
                }
                _ => prop_assert!(false, "expected OrderCharged event"),
            }
        }
    }
}
