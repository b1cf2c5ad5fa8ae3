//! Vehicle ledger domain module (event-sourced).
//!
//! One ledger per `(site, plate)` tracks how many paid washes a vehicle has
//! accumulated and how many free washes it has redeemed. The ledger is the
//! single source of truth for the "every 10th visit is free" rule; order
//! creation reads it, order charging advances it.

pub mod ledger;

pub use ledger::{
    CYCLE_LENGTH, CountPaidWash, CyclePosition, FreeWashRedeemed, PaidWashCounted,
    QuarantineVehicle, RedeemFreeWash, RegisterVehicle, ReleaseVehicle, VehicleCommand,
    VehicleEvent, VehicleLedger, VehicleLedgerId, VehicleQuarantined, VehicleRegistered,
    VehicleReleased,
};
