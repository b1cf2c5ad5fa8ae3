//! Money and commission arithmetic.
//!
//! Amounts are integers in the smallest currency unit (e.g. cents). The
//! commission split is the one place division happens: the commission is
//! rounded **down** and the business share is the exact complement, so the
//! two always reconstruct the total with no rounding loss.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Amount in smallest currency unit (e.g., cents).
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor_units(amount: u64) -> Self {
        Self(amount)
    }

    pub const fn minor_units(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Saturating addition for read-model accumulation.
    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Commission percentage in basis points (1/100th of a percent).
///
/// 40% is `4000` bps. Stored as basis points so rates like 12.5% stay exact
/// integers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRate(u16);

impl CommissionRate {
    pub const MAX_BASIS_POINTS: u16 = 10_000;

    pub fn from_basis_points(bps: u16) -> DomainResult<Self> {
        if bps > Self::MAX_BASIS_POINTS {
            return Err(DomainError::validation(format!(
                "commission rate {bps} bps exceeds 100%"
            )));
        }
        Ok(Self(bps))
    }

    pub fn from_percent(percent: u16) -> DomainResult<Self> {
        if percent > 100 {
            return Err(DomainError::validation(format!(
                "commission rate {percent}% exceeds 100%"
            )));
        }
        Ok(Self(percent * 100))
    }

    pub const fn basis_points(self) -> u16 {
        self.0
    }

    /// Split a total into washer commission and business share.
    ///
    /// `commission = floor(total * rate)`; the business share is the exact
    /// remainder. Never rounds the business share independently.
    pub fn split(self, total: Money) -> CommissionSplit {
        let commission =
            (u128::from(total.minor_units()) * u128::from(self.0) / 10_000) as u64;
        // rate <= 10_000 bps, so commission <= total and the subtraction is exact
        CommissionSplit {
            total,
            commission: Money(commission),
            business_share: Money(total.minor_units() - commission),
        }
    }
}

impl core::fmt::Display for CommissionRate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Result of splitting an order total between washer and business.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub total: Money,
    pub commission: Money,
    pub business_share: Money,
}

impl CommissionSplit {
    /// True when the two shares reconstruct the total exactly.
    pub fn reconstructs_total(&self) -> bool {
        self.commission
            .checked_add(self.business_share)
            .is_some_and(|sum| sum == self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forty_percent_of_15000() {
        let split = CommissionRate::from_percent(40)
            .unwrap()
            .split(Money::from_minor_units(15_000));
        assert_eq!(split.commission, Money::from_minor_units(6_000));
        assert_eq!(split.business_share, Money::from_minor_units(9_000));
        assert!(split.reconstructs_total());
    }

    #[test]
    fn commission_rounds_down_and_business_absorbs_remainder() {
        let split = CommissionRate::from_percent(33)
            .unwrap()
            .split(Money::from_minor_units(1_001));
        // 33% of 1001 is 330.33; the fractional cent stays with the business
        assert_eq!(split.commission, Money::from_minor_units(330));
        assert_eq!(split.business_share, Money::from_minor_units(671));
        assert!(split.reconstructs_total());
    }

    #[test]
    fn zero_rate_gives_business_everything() {
        let split = CommissionRate::from_percent(0)
            .unwrap()
            .split(Money::from_minor_units(2_500));
        assert_eq!(split.commission, Money::ZERO);
        assert_eq!(split.business_share, Money::from_minor_units(2_500));
    }

    #[test]
    fn zero_total_splits_to_zero() {
        let split = CommissionRate::from_percent(40).unwrap().split(Money::ZERO);
        assert_eq!(split.commission, Money::ZERO);
        assert_eq!(split.business_share, Money::ZERO);
        assert!(split.reconstructs_total());
    }

    #[test]
    fn full_rate_gives_washer_everything() {
        let split = CommissionRate::from_basis_points(10_000)
            .unwrap()
            .split(Money::from_minor_units(999));
        assert_eq!(split.commission, Money::from_minor_units(999));
        assert_eq!(split.business_share, Money::ZERO);
    }

    #[test]
    fn rejects_rates_over_100_percent() {
        assert!(CommissionRate::from_percent(101).is_err());
        assert!(CommissionRate::from_basis_points(10_001).is_err());
        assert!(CommissionRate::from_basis_points(10_000).is_ok());
    }

    #[test]
    fn fractional_percent_rates_stay_exact() {
        // 12.5% of 800 = 100
        let split = CommissionRate::from_basis_points(1_250)
            .unwrap()
            .split(Money::from_minor_units(800));
        assert_eq!(split.commission, Money::from_minor_units(100));
        assert_eq!(split.business_share, Money::from_minor_units(700));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: for any total and any rate up to 100%, the two
            /// shares reconstruct the total exactly and the commission never
            /// exceeds it.
            #[test]
            fn split_never_loses_or_invents_money(
                total in 0u64..=u64::MAX,
                bps in 0u16..=CommissionRate::MAX_BASIS_POINTS,
            ) {
                let split = CommissionRate::from_basis_points(bps)
                    .unwrap()
                    .split(Money::from_minor_units(total));

                prop_assert!(split.reconstructs_total());
                prop_assert!(split.commission <= split.total);
                prop_assert_eq!(
                    split.commission.minor_units() + split.business_share.minor_units(),
                    total
                );
            }
        }
    }
}
