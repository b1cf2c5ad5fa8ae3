//! Site-isolated read model storage abstractions.

pub mod site_store;

pub use site_store::{InMemorySiteStore, SiteStore};
