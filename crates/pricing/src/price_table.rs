use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use sudspoint_core::{DomainError, DomainResult, Money};

/// Vehicle category used for pricing (e.g. "sedan", "suv", "pickup").
///
/// Normalized to lowercase with surrounding whitespace trimmed, so operator
/// input like `" SUV "` matches the configured `"suv"` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleClass(String);

impl VehicleClass {
    pub fn new(raw: &str) -> DomainResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::validation("vehicle class must not be empty"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wash service kind (e.g. "basic", "deluxe", "wax").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WashKind(String);

impl WashKind {
    pub fn new(raw: &str) -> DomainResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::validation("wash kind must not be empty"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WashKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only price lookup consulted at order creation.
///
/// `None` means the combination is not offered; the order flow turns that
/// into a validation failure instead of guessing a price.
pub trait PriceTable: Send + Sync {
    fn lookup(&self, vehicle_class: &VehicleClass, wash_kind: &WashKind) -> Option<Money>;
}

/// In-memory price table for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryPriceTable {
    prices: RwLock<HashMap<(VehicleClass, WashKind), Money>>,
}

impl InMemoryPriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure (or overwrite) the price for a combination.
    pub fn set_price(
        &self,
        vehicle_class: VehicleClass,
        wash_kind: WashKind,
        price: Money,
    ) -> DomainResult<()> {
        let mut prices = self
            .prices
            .write()
            .map_err(|_| DomainError::conflict("price table lock poisoned"))?;
        prices.insert((vehicle_class, wash_kind), price);
        Ok(())
    }

    /// Stop offering a combination.
    pub fn remove_price(
        &self,
        vehicle_class: &VehicleClass,
        wash_kind: &WashKind,
    ) -> DomainResult<()> {
        let mut prices = self
            .prices
            .write()
            .map_err(|_| DomainError::conflict("price table lock poisoned"))?;
        prices.remove(&(vehicle_class.clone(), wash_kind.clone()));
        Ok(())
    }
}

impl PriceTable for InMemoryPriceTable {
    fn lookup(&self, vehicle_class: &VehicleClass, wash_kind: &WashKind) -> Option<Money> {
        self.prices
            .read()
            .ok()?
            .get(&(vehicle_class.clone(), wash_kind.clone()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_configured_price() {
        let table = InMemoryPriceTable::new();
        table
            .set_price(
                VehicleClass::new("sedan").unwrap(),
                WashKind::new("basic").unwrap(),
                Money::from_minor_units(2_500),
            )
            .unwrap();

        let price = table.lookup(
            &VehicleClass::new("sedan").unwrap(),
            &WashKind::new("basic").unwrap(),
        );
        assert_eq!(price, Some(Money::from_minor_units(2_500)));
    }

    #[test]
    fn lookup_misses_unconfigured_combination() {
        let table = InMemoryPriceTable::new();
        table
            .set_price(
                VehicleClass::new("sedan").unwrap(),
                WashKind::new("basic").unwrap(),
                Money::from_minor_units(2_500),
            )
            .unwrap();

        let price = table.lookup(
            &VehicleClass::new("truck").unwrap(),
            &WashKind::new("basic").unwrap(),
        );
        assert_eq!(price, None);
    }

    #[test]
    fn class_and_kind_normalize_case_and_whitespace() {
        let table = InMemoryPriceTable::new();
        table
            .set_price(
                VehicleClass::new(" SUV ").unwrap(),
                WashKind::new("Deluxe").unwrap(),
                Money::from_minor_units(4_000),
            )
            .unwrap();

        let price = table.lookup(
            &VehicleClass::new("suv").unwrap(),
            &WashKind::new("deluxe").unwrap(),
        );
        assert_eq!(price, Some(Money::from_minor_units(4_000)));
    }

    #[test]
    fn removed_combination_stops_being_offered() {
        let table = InMemoryPriceTable::new();
        let class = VehicleClass::new("sedan").unwrap();
        let kind = WashKind::new("wax").unwrap();
        table
            .set_price(class.clone(), kind.clone(), Money::from_minor_units(6_000))
            .unwrap();
        table.remove_price(&class, &kind).unwrap();

        assert_eq!(table.lookup(&class, &kind), None);
    }

    #[test]
    fn rejects_empty_class_and_kind() {
        assert!(VehicleClass::new("  ").is_err());
        assert!(WashKind::new("").is_err());
    }

    #[test]
    fn poisoned_lock_refuses_writes_instead_of_dropping_them() {
        let table = InMemoryPriceTable::new();
        let class = VehicleClass::new("sedan").unwrap();
        let kind = WashKind::new("basic").unwrap();

        std::thread::scope(|scope| {
            let poison = scope.spawn(|| {
                let _guard = table.prices.write().unwrap();
                panic!("poisoning the price map");
            });
            assert!(poison.join().is_err());
        });

        let err = table
            .set_price(class.clone(), kind.clone(), Money::from_minor_units(2_500))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert!(matches!(
            table.remove_price(&class, &kind).unwrap_err(),
            DomainError::Conflict(_)
        ));
    }
}
