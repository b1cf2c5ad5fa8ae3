use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use sudspoint_core::{CommissionRate, DomainError, DomainResult, WasherId};

/// Per-washer commission configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasherProfile {
    /// Short human-readable code printed on receipts (e.g. "W-07").
    pub code: String,
    pub rate: CommissionRate,
}

/// Lookup of washer commission configuration, consulted at charge time.
///
/// A washer without a profile is a hard failure for the charge: there is no
/// default rate to fall back on, because a silently-defaulted rate would
/// produce commission entries nobody configured.
pub trait WasherDirectory: Send + Sync {
    fn commission_profile(&self, washer_id: &WasherId) -> Option<WasherProfile>;
}

/// In-memory washer directory for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryWasherDirectory {
    washers: RwLock<HashMap<WasherId, WasherProfile>>,
}

impl InMemoryWasherDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or update) a washer's code and commission rate.
    pub fn register(
        &self,
        washer_id: WasherId,
        code: impl Into<String>,
        rate: CommissionRate,
    ) -> DomainResult<()> {
        let code = code.into();
        if code.trim().is_empty() {
            return Err(DomainError::validation("washer code cannot be empty"));
        }
        let mut washers = self
            .washers
            .write()
            .map_err(|_| DomainError::conflict("washer directory lock poisoned"))?;
        washers.insert(washer_id, WasherProfile { code, rate });
        Ok(())
    }

    /// Remove a washer; subsequent charges naming them will fail validation.
    pub fn remove(&self, washer_id: &WasherId) -> DomainResult<()> {
        let mut washers = self
            .washers
            .write()
            .map_err(|_| DomainError::conflict("washer directory lock poisoned"))?;
        washers.remove(washer_id);
        Ok(())
    }
}

impl WasherDirectory for InMemoryWasherDirectory {
    fn commission_profile(&self, washer_id: &WasherId) -> Option<WasherProfile> {
        self.washers.read().ok()?.get(washer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_washer_is_found_with_rate() {
        let directory = InMemoryWasherDirectory::new();
        let washer_id = WasherId::new();
        directory
            .register(washer_id, "W-07", CommissionRate::from_percent(40).unwrap())
            .unwrap();

        let profile = directory.commission_profile(&washer_id).unwrap();
        assert_eq!(profile.code, "W-07");
        assert_eq!(profile.rate, CommissionRate::from_percent(40).unwrap());
    }

    #[test]
    fn unknown_washer_has_no_profile() {
        let directory = InMemoryWasherDirectory::new();
        assert!(directory.commission_profile(&WasherId::new()).is_none());
    }

    #[test]
    fn empty_code_is_rejected() {
        let directory = InMemoryWasherDirectory::new();
        let err = directory
            .register(
                WasherId::new(),
                "   ",
                CommissionRate::from_percent(40).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn removed_washer_stops_resolving() {
        let directory = InMemoryWasherDirectory::new();
        let washer_id = WasherId::new();
        directory
            .register(washer_id, "W-01", CommissionRate::from_percent(0).unwrap())
            .unwrap();
        directory.remove(&washer_id).unwrap();
        assert!(directory.commission_profile(&washer_id).is_none());
    }

    #[test]
    fn poisoned_lock_refuses_writes_instead_of_dropping_them() {
        let directory = InMemoryWasherDirectory::new();
        let washer_id = WasherId::new();

        std::thread::scope(|scope| {
            let poison = scope.spawn(|| {
                let _guard = directory.washers.write().unwrap();
                panic!("poisoning the washer map");
            });
            assert!(poison.join().is_err());
        });

        let err = directory
            .register(washer_id, "W-07", CommissionRate::from_percent(40).unwrap())
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert!(matches!(
            directory.remove(&washer_id).unwrap_err(),
            DomainError::Conflict(_)
        ));
    }
}
