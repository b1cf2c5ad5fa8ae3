//! Pricing domain module.
//!
//! The price table is a collaborator of the order flow: order creation looks
//! up the price for a `(vehicle class, wash kind)` combination and refuses
//! combinations the site does not offer. No pricing rule lives anywhere else.

pub mod price_table;

pub use price_table::{InMemoryPriceTable, PriceTable, VehicleClass, WashKind};
