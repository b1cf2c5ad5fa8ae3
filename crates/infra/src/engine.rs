//! The wash engine: the one entry point for counter operations.
//!
//! Coordinates the three aggregates behind a charge (vehicle ledger,
//! commission ledger, wash order) plus the pricing and washer collaborators,
//! and owns the ordering that makes an interrupted charge resumable:
//!
//! ```text
//! charge_order
//!   1. load order, validate payment        (no side effects yet)
//!   2. resolve washer commission profile   (no side effects yet)
//!   3. write charge marker to the order    (cancellation refused from here)
//!   4. advance vehicle counter             (idempotent per order)
//!   5. append commission entry             (exactly-once per order)
//!   6. mark order charged                  (the commit point)
//! ```
//!
//! Steps 3 through 5 tolerate re-execution, so a crash between any two steps
//! is repaired by issuing the same charge again; the order stays `Pending`
//! until step 6 flips its status. On resumption the commission entry already
//! on record wins over the current attempt's washer and rate, so the order's
//! `Charged` event always agrees with the ledger that pays out.
//!
//! The marker in step 3 doubles as the cancellation guard. Every cross-stream
//! side effect of a charge is preceded by a write to the order's own stream,
//! so a cancel and a charge serialize there: a cancel that commits first
//! invalidates the marker's version check before any counter or commission
//! effect exists, and a cancel arriving after the marker is refused by the
//! order aggregate itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use sudspoint_commissions::{
    AppendEntry, CommissionLedger, CommissionLedgerCommand, CommissionLedgerId, WasherDirectory,
};
use sudspoint_core::{
    Aggregate, AggregateId, CommissionSplit, DomainError, Money, Plate, SiteId, WasherId,
};
use sudspoint_events::{EventBus, EventEnvelope};
use sudspoint_orders::{
    BeginCharge, CancelOrder, ChargeOrder, CreateOrder, PaymentMethod, WashOrder,
    WashOrderCommand, WashOrderId, WashOrderStatus,
};
use sudspoint_pricing::{PriceTable, VehicleClass, WashKind};
use sudspoint_vehicles::{
    CountPaidWash, CyclePosition, QuarantineVehicle, RedeemFreeWash, RegisterVehicle,
    ReleaseVehicle, VehicleCommand, VehicleLedger, VehicleLedgerId,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, apply_history};
use crate::event_store::{EventStore, EventStoreError, StoredEvent};
use crate::projections::{
    OrderReadModel, SiteRevenue, SiteRevenueProjection, WashOrdersProjection, WasherBalance,
    WasherBalancesProjection, WasherEntryLog,
};
use crate::read_model::InMemorySiteStore;

/// Bounded retry budget for optimistic-concurrency losses. Every loss means
/// another writer committed, so a full charge rush on one vehicle drains in
/// at most one retry per competitor; 64 leaves slack beyond any realistic
/// number of concurrent counters at one site.
const MAX_DISPATCH_RETRIES: u32 = 64;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found")]
    NotFound,
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("consistency violation: {0}")]
    Consistency(String),
    #[error("concurrent conflict: {0}")]
    Conflict(String),
    #[error("failed to deserialize stored events: {0}")]
    Deserialize(String),
    #[error("event store failure: {0}")]
    Store(EventStoreError),
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => EngineError::Validation(msg),
            DomainError::InvalidState(msg) => EngineError::InvalidState(msg),
            DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::NotFound => EngineError::NotFound,
            DomainError::Duplicate(msg) => EngineError::Duplicate(msg),
            DomainError::Consistency(msg) => EngineError::Consistency(msg),
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
        }
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Concurrency(msg) => EngineError::Conflict(msg),
            DispatchError::SiteIsolation(msg) => EngineError::Consistency(msg),
            DispatchError::Validation(msg) => EngineError::Validation(msg),
            DispatchError::InvalidState(msg) => EngineError::InvalidState(msg),
            DispatchError::Duplicate(msg) => EngineError::Duplicate(msg),
            DispatchError::Consistency(msg) => EngineError::Consistency(msg),
            DispatchError::NotFound => EngineError::NotFound,
            DispatchError::Deserialize(msg) => EngineError::Deserialize(msg),
            DispatchError::Store(e) => EngineError::Store(e),
            DispatchError::Publish(msg) => EngineError::Publish(msg),
        }
    }
}

impl From<EventStoreError> for EngineError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => EngineError::Conflict(msg),
            EventStoreError::SiteIsolation(msg) => EngineError::Consistency(msg),
            EventStoreError::Publish(msg) => EngineError::Publish(msg),
            other => EngineError::Store(other),
        }
    }
}

/// Outcome of opening an order at the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub order_id: WashOrderId,
    pub plate: Plate,
    pub total: Money,
    pub is_free_wash: bool,
    pub cycle_position: u8,
}

/// Everything the counter needs to print after a successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub order_id: WashOrderId,
    pub plate: Plate,
    pub total: Money,
    pub amount_received: Money,
    pub change_due: Money,
    pub is_free_wash: bool,
    pub cycle_position: u8,
    pub washer_code: String,
    pub payment_method: PaymentMethod,
    pub commission: CommissionSplit,
    pub charged_at: DateTime<Utc>,
}

/// All read models of the system, fed from one bus subscription.
#[derive(Debug)]
pub struct ProjectionSet {
    pub orders: WashOrdersProjection<Arc<InMemorySiteStore<WashOrderId, OrderReadModel>>>,
    pub balances: WasherBalancesProjection<Arc<InMemorySiteStore<WasherId, WasherEntryLog>>>,
    pub revenue: SiteRevenueProjection<Arc<InMemorySiteStore<SiteId, SiteRevenue>>>,
}

impl Default for ProjectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionSet {
    pub fn new() -> Self {
        Self {
            orders: WashOrdersProjection::new(Arc::new(InMemorySiteStore::new())),
            balances: WasherBalancesProjection::new(Arc::new(InMemorySiteStore::new())),
            revenue: SiteRevenueProjection::new(Arc::new(InMemorySiteStore::new())),
        }
    }

    /// Feed one envelope to every projection. Projection failures are logged
    /// and swallowed: a lagging read model is repaired by a rebuild, and must
    /// never fail the write path that published the event.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) {
        let results = [
            ("orders.wash_orders", self.orders.apply_envelope(envelope)),
            ("commissions.washer_balances", self.balances.apply_envelope(envelope)),
            ("orders.site_revenue", self.revenue.apply_envelope(envelope)),
        ];
        for (projection, result) in results {
            if let Err(error) = result {
                tracing::warn!(
                    projection,
                    %error,
                    event_id = %envelope.event_id(),
                    "projection update failed; read model lags until rebuilt"
                );
            }
        }
    }
}

/// Drain a bus subscription into the projection set on a dedicated thread.
///
/// Subscribes before spawning, so events published after this call returns
/// are never missed (the channel buffers them until the thread drains it).
/// The thread exits when the bus is dropped.
pub fn spawn_projection_feed<B>(
    bus: &B,
    read_models: Arc<ProjectionSet>,
) -> std::thread::JoinHandle<()>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    let subscription = bus.subscribe();
    std::thread::spawn(move || {
        while let Ok(envelope) = subscription.recv() {
            read_models.apply_envelope(&envelope);
        }
    })
}

/// Facade over the full order lifecycle for one deployment.
///
/// Generic over the event store and bus, so the whole engine runs in memory
/// in tests and benches. Writes go through the [`CommandDispatcher`]; reads
/// that feed *decisions* (charge guards, cancel guards, cycle position)
/// rehydrate aggregates straight from the store, never from projections,
/// because projections are asynchronous and may lag behind a commit.
pub struct WashEngine<S, B> {
    store: Arc<S>,
    dispatcher: CommandDispatcher<Arc<S>, Arc<B>>,
    prices: Arc<dyn PriceTable>,
    washers: Arc<dyn WasherDirectory>,
    read_models: Arc<ProjectionSet>,
}

impl<S, B> WashEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        store: Arc<S>,
        bus: Arc<B>,
        prices: Arc<dyn PriceTable>,
        washers: Arc<dyn WasherDirectory>,
        read_models: Arc<ProjectionSet>,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store.clone(), bus),
            store,
            prices,
            washers,
            read_models,
        }
    }

    pub fn read_models(&self) -> &ProjectionSet {
        &self.read_models
    }

    /// Open a wash order for a vehicle.
    ///
    /// Registers the vehicle ledger on first sight, resolves the price for
    /// the `(vehicle class, wash kind)` combination and pins the free-wash
    /// decision from the ledger's counters at this instant. A free order is
    /// created with a zero total; the price must still be configured, so a
    /// combination the site does not offer fails even on the free slot.
    pub fn create_order(
        &self,
        site_id: SiteId,
        plate: &str,
        vehicle_class: &VehicleClass,
        wash_kind: &WashKind,
    ) -> Result<NewOrder, EngineError> {
        let plate = Plate::parse(plate)?;
        let ledger_id = VehicleLedgerId::for_vehicle(&site_id, &plate);
        self.register_vehicle_if_needed(site_id, ledger_id, &plate)?;

        let ledger = self.load_vehicle(site_id, ledger_id)?;
        let position = ledger.cycle_position();

        let price = self
            .prices
            .lookup(vehicle_class, wash_kind)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "no price configured for vehicle class '{vehicle_class}' and wash kind '{wash_kind}'"
                ))
            })?;
        let total = if position.next_wash_is_free {
            Money::ZERO
        } else {
            price
        };

        let order_id = WashOrderId::new(AggregateId::new());
        self.dispatcher.dispatch::<WashOrder>(
            site_id,
            order_id.0,
            "orders.wash_order",
            WashOrderCommand::CreateOrder(CreateOrder {
                site_id,
                order_id,
                plate: plate.clone(),
                vehicle_class: vehicle_class.clone(),
                wash_kind: wash_kind.clone(),
                total,
                is_free_wash: position.next_wash_is_free,
                cycle_position: position.next_position,
                occurred_at: Utc::now(),
            }),
            |_, id| WashOrder::empty(WashOrderId::new(id)),
        )?;

        tracing::info!(
            %site_id,
            %order_id,
            %plate,
            total = total.minor_units(),
            is_free_wash = position.next_wash_is_free,
            cycle_position = position.next_position,
            "wash order created"
        );

        Ok(NewOrder {
            order_id,
            plate,
            total,
            is_free_wash: position.next_wash_is_free,
            cycle_position: position.next_position,
        })
    }

    /// Charge a pending order: the commit point of the whole flow.
    ///
    /// Side effects happen in resumption-safe order (charge marker, counter,
    /// commission entry, then the order's own `Charged` event); see the
    /// module docs. Underpayment is rejected before any side effect. Losing
    /// the final compare-and-swap on the order stream means someone else
    /// charged it first; the terminal state is re-read and reported as
    /// `InvalidState` rather than a bare conflict.
    pub fn charge_order(
        &self,
        site_id: SiteId,
        order_id: WashOrderId,
        washer_id: WasherId,
        payment_method: PaymentMethod,
        amount_received: Money,
    ) -> Result<ChargeReceipt, EngineError> {
        // 1) Load the order and validate before any side effect.
        let order = self.load_order(site_id, order_id)?;
        if !order.is_created() {
            return Err(EngineError::NotFound);
        }
        match order.status() {
            WashOrderStatus::Pending => {}
            WashOrderStatus::Charged => {
                return Err(EngineError::InvalidState("order is already charged".to_string()));
            }
            WashOrderStatus::Cancelled => {
                return Err(EngineError::InvalidState("order is cancelled".to_string()));
            }
        }
        if amount_received < order.total() {
            return Err(EngineError::Validation(format!(
                "amount received {} is less than order total {}",
                amount_received,
                order.total()
            )));
        }
        let plate = order
            .plate()
            .cloned()
            .ok_or_else(|| EngineError::Consistency("created order has no plate".to_string()))?;
        let total = order.total();
        let is_free_wash = order.is_free_wash();
        let cycle_position = order.cycle_position();

        // 2) Resolve the washer's commission profile.
        let profile = self.washers.commission_profile(&washer_id).ok_or_else(|| {
            EngineError::Validation("washer has no configured commission rate".to_string())
        })?;
        let washer_code = profile.code.clone();

        // 3) Pin the charge onto the order's own stream. A concurrent cancel
        // either commits before this marker (failing the marker's version
        // check with nothing else written yet) or is refused once the marker
        // exists. Re-running this step on resumption commits nothing.
        self.dispatch_with_retry::<WashOrder>(
            site_id,
            order_id.0,
            "orders.wash_order",
            WashOrderCommand::BeginCharge(BeginCharge {
                site_id,
                order_id,
                occurred_at: Utc::now(),
            }),
            |_, id| WashOrder::empty(WashOrderId::new(id)),
        )?;

        // 4) Advance the vehicle counter. Quarantined and unregistered
        // vehicles are refused here, before money changes hands. An empty
        // commit means the counter already saw this order id: we are resuming
        // an interrupted charge.
        let ledger_id = VehicleLedgerId::for_vehicle(&site_id, &plate);
        let counter_command = if is_free_wash {
            VehicleCommand::RedeemFreeWash(RedeemFreeWash {
                site_id,
                ledger_id,
                order_id,
                occurred_at: Utc::now(),
            })
        } else {
            VehicleCommand::CountPaidWash(CountPaidWash {
                site_id,
                ledger_id,
                order_id,
                occurred_at: Utc::now(),
            })
        };
        let committed = match self.dispatch_with_retry::<VehicleLedger>(
            site_id,
            ledger_id.0,
            "vehicles.ledger",
            counter_command,
            |_, id| VehicleLedger::empty(VehicleLedgerId::new(id)),
        ) {
            Ok(committed) => committed,
            Err(e) => {
                if let EngineError::Consistency(msg) = &e {
                    tracing::error!(%site_id, %order_id, %plate, %msg, "charge refused by the vehicle ledger");
                }
                return Err(e);
            }
        };
        if committed.is_empty() {
            tracing::warn!(
                %site_id,
                %order_id,
                "vehicle counter already advanced for this order; resuming an interrupted charge"
            );
        }

        // 5) Append the commission entry. A duplicate means the entry is
        // already on the ledger from an interrupted charge; that recorded
        // entry is what the washer will be paid from, so the rest of this
        // charge adopts its washer and rate even if the caller or the
        // directory has since changed.
        let commission_ledger_id = CommissionLedgerId::for_site(&site_id);
        let append = CommissionLedgerCommand::AppendEntry(AppendEntry {
            site_id,
            ledger_id: commission_ledger_id,
            order_id,
            washer_id,
            washer_code: washer_code.clone(),
            total,
            rate: profile.rate,
            occurred_at: Utc::now(),
        });
        let (washer_id, washer_code, commission_rate) = match self
            .dispatch_with_retry::<CommissionLedger>(
                site_id,
                commission_ledger_id.0,
                "commissions.ledger",
                append,
                |_, id| CommissionLedger::empty(CommissionLedgerId::new(id)),
            ) {
            Ok(_) => (washer_id, washer_code, profile.rate),
            Err(EngineError::Duplicate(_)) => {
                let ledger = self.load_commission_ledger(site_id)?;
                let recorded = ledger.entry_for(order_id).cloned().ok_or_else(|| {
                    EngineError::Consistency(
                        "commission ledger rejected the entry as a duplicate but holds no entry \
                         for this order"
                            .to_string(),
                    )
                })?;
                if recorded.washer_id != washer_id || recorded.rate != profile.rate {
                    tracing::warn!(
                        %site_id,
                        %order_id,
                        recorded_washer = %recorded.washer_code,
                        recorded_rate = recorded.rate.basis_points(),
                        "commission entry already recorded with different terms; adopting the recorded entry"
                    );
                } else {
                    tracing::warn!(
                        %site_id,
                        %order_id,
                        "commission entry already recorded for this order; resuming an interrupted charge"
                    );
                }
                (recorded.washer_id, recorded.washer_code, recorded.rate)
            }
            Err(e) => return Err(e),
        };

        // 6) Commit point: flip the order to Charged. No retry here; losing
        // the CAS means a competing charge won, which is a terminal answer,
        // not a transient condition.
        let charge = WashOrderCommand::ChargeOrder(ChargeOrder {
            site_id,
            order_id,
            washer_id,
            washer_code: washer_code.clone(),
            payment_method,
            amount_received,
            commission_rate,
            occurred_at: Utc::now(),
        });
        let charge_result = self.dispatcher.dispatch::<WashOrder>(
            site_id,
            order_id.0,
            "orders.wash_order",
            charge,
            |_, id| WashOrder::empty(WashOrderId::new(id)),
        );
        if let Err(err) = charge_result {
            return Err(match err {
                DispatchError::Concurrency(msg) => self.report_order_race(site_id, order_id, msg),
                other => EngineError::from(other),
            });
        }

        // 7) Build the receipt from the now-charged order.
        let order = self.load_order(site_id, order_id)?;
        let commission = order.commission().copied().ok_or_else(|| {
            EngineError::Consistency("charged order has no commission split".to_string())
        })?;
        let charged_at = order.charged_at().ok_or_else(|| {
            EngineError::Consistency("charged order has no charge timestamp".to_string())
        })?;
        let change_due = order.change_due().ok_or_else(|| {
            EngineError::Consistency("charged order has no change recorded".to_string())
        })?;

        tracing::info!(
            %site_id,
            %order_id,
            %plate,
            total = total.minor_units(),
            commission = commission.commission.minor_units(),
            business_share = commission.business_share.minor_units(),
            is_free_wash,
            "wash order charged"
        );

        Ok(ChargeReceipt {
            order_id,
            plate,
            total,
            amount_received,
            change_due,
            is_free_wash,
            cycle_position,
            washer_code: order
                .washer_code()
                .unwrap_or(washer_code.as_str())
                .to_string(),
            payment_method,
            commission,
            charged_at,
        })
    }

    /// Cancel a pending order.
    ///
    /// Serialized against a concurrent charge on the order's own stream: the
    /// charge pins a marker event there before touching any other stream, so
    /// a cancel either commits ahead of the marker (the charge then backs
    /// off with nothing written) or finds the marker and is refused. An
    /// order that has begun charging can only be charged to completion, so a
    /// cancelled order never carries a counted wash or a commission entry.
    pub fn cancel_order(
        &self,
        site_id: SiteId,
        order_id: WashOrderId,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.dispatch_with_retry::<WashOrder>(
            site_id,
            order_id.0,
            "orders.wash_order",
            WashOrderCommand::CancelOrder(CancelOrder {
                site_id,
                order_id,
                reason,
                occurred_at: Utc::now(),
            }),
            |_, id| WashOrder::empty(WashOrderId::new(id)),
        )?;

        tracing::info!(%site_id, %order_id, "wash order cancelled");
        Ok(())
    }

    /// Where the vehicle stands in its loyalty cycle right now.
    ///
    /// A vehicle this site has never seen is simply at the start of its first
    /// cycle, not an error.
    pub fn cycle_position(&self, site_id: SiteId, plate: &str) -> Result<CyclePosition, EngineError> {
        let plate = Plate::parse(plate)?;
        let ledger = self.load_vehicle(site_id, VehicleLedgerId::for_vehicle(&site_id, &plate))?;
        Ok(ledger.cycle_position())
    }

    /// Halt all charges for a vehicle until an operator releases it.
    pub fn quarantine_vehicle(
        &self,
        site_id: SiteId,
        plate: &str,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let plate = Plate::parse(plate)?;
        let ledger_id = VehicleLedgerId::for_vehicle(&site_id, &plate);
        self.dispatch_with_retry::<VehicleLedger>(
            site_id,
            ledger_id.0,
            "vehicles.ledger",
            VehicleCommand::QuarantineVehicle(QuarantineVehicle {
                site_id,
                ledger_id,
                reason: reason.into(),
                occurred_at: Utc::now(),
            }),
            |_, id| VehicleLedger::empty(VehicleLedgerId::new(id)),
        )?;
        tracing::warn!(%site_id, %plate, "vehicle quarantined");
        Ok(())
    }

    /// Lift a quarantine.
    pub fn release_vehicle(&self, site_id: SiteId, plate: &str) -> Result<(), EngineError> {
        let plate = Plate::parse(plate)?;
        let ledger_id = VehicleLedgerId::for_vehicle(&site_id, &plate);
        self.dispatch_with_retry::<VehicleLedger>(
            site_id,
            ledger_id.0,
            "vehicles.ledger",
            VehicleCommand::ReleaseVehicle(ReleaseVehicle {
                site_id,
                ledger_id,
                occurred_at: Utc::now(),
            }),
            |_, id| VehicleLedger::empty(VehicleLedgerId::new(id)),
        )?;
        tracing::info!(%site_id, %plate, "vehicle released from quarantine");
        Ok(())
    }

    /// A washer's folded balance over the half-open window `[from, to)`.
    pub fn washer_balance(
        &self,
        site_id: SiteId,
        washer_id: WasherId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> WasherBalance {
        self.read_models.balances.balance(site_id, washer_id, from, to)
    }

    /// All-time balances for every washer the site has paid commission to.
    pub fn list_washer_balances(&self, site_id: SiteId) -> Vec<WasherBalance> {
        self.read_models.balances.list(site_id)
    }

    pub fn get_order(&self, site_id: SiteId, order_id: WashOrderId) -> Option<OrderReadModel> {
        self.read_models.orders.get(site_id, &order_id)
    }

    pub fn list_orders(&self, site_id: SiteId) -> Vec<OrderReadModel> {
        self.read_models.orders.list(site_id)
    }

    pub fn site_revenue(&self, site_id: SiteId) -> SiteRevenue {
        self.read_models.revenue.summary(site_id)
    }

    /// First sight of a plate opens its ledger stream. Losing the race to a
    /// concurrent first order is fine; the ledger then already exists.
    fn register_vehicle_if_needed(
        &self,
        site_id: SiteId,
        ledger_id: VehicleLedgerId,
        plate: &Plate,
    ) -> Result<(), EngineError> {
        let register = VehicleCommand::RegisterVehicle(RegisterVehicle {
            site_id,
            ledger_id,
            plate: plate.clone(),
            occurred_at: Utc::now(),
        });
        match self.dispatch_with_retry::<VehicleLedger>(
            site_id,
            ledger_id.0,
            "vehicles.ledger",
            register,
            |_, id| VehicleLedger::empty(VehicleLedgerId::new(id)),
        ) {
            Ok(_) | Err(EngineError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Dispatch with a bounded retry on optimistic-concurrency losses.
    ///
    /// Used wherever re-deciding the command against refreshed state is
    /// always valid: the ledger streams (vehicle counters, commission
    /// entries), the charge marker, and cancellation. The final
    /// `ChargeOrder` commit never goes through here; losing that race is a
    /// terminal answer, not a transient condition.
    fn dispatch_with_retry<A>(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(SiteId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, EngineError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: sudspoint_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempts = 0u32;
        loop {
            match self.dispatcher.dispatch::<A>(
                site_id,
                aggregate_id,
                aggregate_type,
                command.clone(),
                &make_aggregate,
            ) {
                Err(DispatchError::Concurrency(msg)) => {
                    attempts += 1;
                    if attempts >= MAX_DISPATCH_RETRIES {
                        tracing::error!(
                            %site_id,
                            %aggregate_id,
                            aggregate_type,
                            attempts,
                            "giving up after repeated concurrency losses"
                        );
                        return Err(EngineError::Conflict(msg));
                    }
                    std::thread::yield_now();
                }
                other => return other.map_err(EngineError::from),
            }
        }
    }

    /// Turn a lost CAS on the order stream into the terminal state the caller
    /// actually raced against.
    fn report_order_race(&self, site_id: SiteId, order_id: WashOrderId, msg: String) -> EngineError {
        match self.load_order(site_id, order_id) {
            Ok(order) => match order.status() {
                WashOrderStatus::Charged => {
                    EngineError::InvalidState("order is already charged".to_string())
                }
                WashOrderStatus::Cancelled => {
                    EngineError::InvalidState("order is cancelled".to_string())
                }
                WashOrderStatus::Pending => EngineError::Conflict(msg),
            },
            Err(e) => e,
        }
    }

    fn load_order(&self, site_id: SiteId, order_id: WashOrderId) -> Result<WashOrder, EngineError> {
        let history = self.store.load_stream(site_id, order_id.0)?;
        let mut order = WashOrder::empty(order_id);
        apply_history::<WashOrder>(&mut order, &history).map_err(EngineError::from)?;
        Ok(order)
    }

    fn load_vehicle(
        &self,
        site_id: SiteId,
        ledger_id: VehicleLedgerId,
    ) -> Result<VehicleLedger, EngineError> {
        let history = self.store.load_stream(site_id, ledger_id.0)?;
        let mut ledger = VehicleLedger::empty(ledger_id);
        apply_history::<VehicleLedger>(&mut ledger, &history).map_err(EngineError::from)?;
        Ok(ledger)
    }

    fn load_commission_ledger(&self, site_id: SiteId) -> Result<CommissionLedger, EngineError> {
        let ledger_id = CommissionLedgerId::for_site(&site_id);
        let history = self.store.load_stream(site_id, ledger_id.0)?;
        let mut ledger = CommissionLedger::empty(ledger_id);
        apply_history::<CommissionLedger>(&mut ledger, &history).map_err(EngineError::from)?;
        Ok(ledger)
    }
}
