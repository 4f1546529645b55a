use std::collections::BTreeSet;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Source};

/// Format used for [`AccountRecord::last_updated`].
pub const LAST_UPDATED_FORMAT: &str = "%m/%d/%Y, %I:%M:%S %p";

/// One user-configured toll account, as persisted.
///
/// The identity fields are stored flat for compatibility with existing
/// account files; [`AccountRecord::ny_identity`] and
/// [`AccountRecord::nj_identity`] give the typed view of them. Balance fields
/// are always present (zero when never fetched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub sources: BTreeSet<Source>,
    #[serde(default, alias = "account_number", skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, alias = "plate_number", skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(default, alias = "ny_plate_number", skip_serializing_if = "Option::is_none")]
    pub ny_plate_number: Option<String>,
    #[serde(default, alias = "violation_number", skip_serializing_if = "Option::is_none")]
    pub violation_number: Option<String>,
    #[serde(default, alias = "nj_plate_number", skip_serializing_if = "Option::is_none")]
    pub nj_plate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        default,
        alias = "ny_balance_amount",
        with = "rust_decimal::serde::float"
    )]
    pub ny_balance: Decimal,
    #[serde(
        default,
        alias = "nj_balance_amount",
        with = "rust_decimal::serde::float"
    )]
    pub nj_balance: Decimal,
    #[serde(default, alias = "balance_amount", with = "rust_decimal::serde::float")]
    pub total_balance: Decimal,
    #[serde(default, alias = "toll_bill_numbers")]
    pub bill_numbers: BTreeSet<String>,
    #[serde(default, alias = "violation_count")]
    pub violation_count: u32,
    #[serde(default, alias = "last_updated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Identity used to query the NY back office.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NyIdentity<'a> {
    pub account_number: &'a str,
    pub plate_number: &'a str,
}

/// Identity used to query the NJ violations back office.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NjIdentity<'a> {
    pub violation_number: &'a str,
    pub plate_number: &'a str,
}

impl Default for AccountRecord {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            sources: BTreeSet::new(),
            account_number: None,
            plate_number: None,
            ny_plate_number: None,
            violation_number: None,
            nj_plate_number: None,
            email: None,
            ny_balance: Decimal::ZERO,
            nj_balance: Decimal::ZERO,
            total_balance: Decimal::ZERO,
            bill_numbers: BTreeSet::new(),
            violation_count: 0,
            last_updated: None,
        }
    }
}

impl AccountRecord {
    pub fn new_ny(account_number: &str, plate_number: &str) -> Self {
        let mut record = Self {
            account_number: Some(account_number.to_string()),
            plate_number: Some(plate_number.to_string()),
            ..Self::default()
        };
        record.sync_sources();
        record
    }

    pub fn new_nj(violation_number: &str, plate_number: &str) -> Self {
        let mut record = Self {
            violation_number: Some(violation_number.to_string()),
            nj_plate_number: Some(plate_number.to_string()),
            ..Self::default()
        };
        record.sync_sources();
        record
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// The NY identity, if both the account number and a plate are present.
    pub fn ny_identity(&self) -> Option<NyIdentity<'_>> {
        let account_number = non_empty(&self.account_number)?;
        let plate_number =
            non_empty(&self.plate_number).or_else(|| non_empty(&self.ny_plate_number))?;
        Some(NyIdentity {
            account_number,
            plate_number,
        })
    }

    /// The NJ identity, if the violation number and a plate are present. The
    /// NJ plate falls back to the shared plate number.
    pub fn nj_identity(&self) -> Option<NjIdentity<'_>> {
        let violation_number = non_empty(&self.violation_number)?;
        let plate_number =
            non_empty(&self.nj_plate_number).or_else(|| non_empty(&self.plate_number))?;
        Some(NjIdentity {
            violation_number,
            plate_number,
        })
    }

    /// Identifier and plate to query `source` with, when that source is
    /// eligible for this record.
    pub fn query_for(&self, source: Source) -> Option<(&str, &str)> {
        match source {
            Source::Ny => self
                .ny_identity()
                .map(|id| (id.account_number, id.plate_number)),
            Source::Nj => self
                .nj_identity()
                .map(|id| (id.violation_number, id.plate_number)),
        }
    }

    pub fn is_eligible(&self, source: Source) -> bool {
        self.query_for(source).is_some()
    }

    pub fn is_reconcilable(&self) -> bool {
        Source::ALL.iter().any(|s| self.is_eligible(*s))
    }

    /// Sources whose identity is complete on this record.
    pub fn populated_sources(&self) -> BTreeSet<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.is_eligible(*s))
            .collect()
    }

    pub fn sync_sources(&mut self) {
        self.sources = self.populated_sources();
    }

    /// Trimmed notification address, if one is configured.
    pub fn email(&self) -> Option<&str> {
        non_empty(&self.email)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.is_reconcilable() {
            Ok(())
        } else {
            Err(Error::MissingIdentity)
        }
    }

    /// Copies the balance fields of `other` into this record, leaving the
    /// identity untouched.
    pub fn copy_balances_from(&mut self, other: &AccountRecord) {
        self.ny_balance = other.ny_balance;
        self.nj_balance = other.nj_balance;
        self.total_balance = other.total_balance;
        self.bill_numbers = other.bill_numbers.clone();
        self.violation_count = other.violation_count;
        self.last_updated = other.last_updated.clone();
    }

    pub fn balance_for(&self, source: Source) -> Decimal {
        match source {
            Source::Ny => self.ny_balance,
            Source::Nj => self.nj_balance,
        }
    }
}

/// Formats an amount for display, truncated (not rounded) to cents.
pub fn format_amount(amount: Decimal) -> String {
    let truncated = amount.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    format!("{:.2}", truncated)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
