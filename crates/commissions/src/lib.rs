//! Commission domain module (event-sourced).
//!
//! Every charged order produces exactly one commission entry in its site's
//! append-only ledger: the washer's cut (rounded down) and the business's
//! share (the exact remainder). Free washes produce zero-value entries so a
//! washer's order count stays honest and the entry log reconciles one-to-one
//! against charged orders.

pub mod directory;
pub mod ledger;

pub use directory::{InMemoryWasherDirectory, WasherDirectory, WasherProfile};
pub use ledger::{
    AppendEntry, CommissionEntry, CommissionLedger, CommissionLedgerCommand,
    CommissionLedgerEvent, CommissionLedgerId, EntryAppended,
};
