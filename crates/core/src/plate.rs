//! Normalized license plate value type.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest plausible plate after normalization; anything longer is operator input error.
const MAX_PLATE_LEN: usize = 16;

/// License plate, normalized so cosmetic differences address the same vehicle.
///
/// Normalization uppercases the input and strips whitespace, dashes and dots:
/// `"ab-123 cd"` and `"AB123CD"` identify the same vehicle ledger. The
/// normalized form is what gets persisted in events and used to derive the
/// vehicle stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plate(String);

impl Plate {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.')
            .flat_map(|c| c.to_uppercase())
            .collect();
        if normalized.is_empty() {
            return Err(DomainError::validation("plate must not be empty"));
        }
        if normalized.chars().count() > MAX_PLATE_LEN {
            return Err(DomainError::validation(format!(
                "plate exceeds {MAX_PLATE_LEN} characters after normalization"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Plate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
