//! Wash order domain module (event-sourced).
//!
//! A wash order is the unit of work at the counter: opened when the car rolls
//! in, charged exactly once when the customer pays (the commit point for
//! loyalty counting and commission), or cancelled before payment. Business
//! rules live here as deterministic domain logic (no IO, no storage).

pub mod order;

pub use order::{
    BeginCharge, CancelOrder, ChargeOrder, ChargeStarted, CreateOrder, OrderCancelled,
    OrderCharged, OrderCreated, PaymentMethod, WashOrder, WashOrderCommand, WashOrderEvent,
    WashOrderId, WashOrderStatus,
};
