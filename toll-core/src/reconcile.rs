//! Multi-source balance reconciliation.
//!
//! A [`Pipeline`] queries each toll source for one [`AccountRecord`], strictly
//! one after the other (NY, then NJ), and merges whatever came back into the
//! record. A source that fails or is not eligible contributes nothing to the
//! merged balances; its failure is reported next to the merged data instead of
//! aborting the whole operation. [`Reconciler`] wraps the pipeline with the
//! optional email notification.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::{format_amount, LAST_UPDATED_FORMAT};
use crate::{AccountRecord, Source};

type Result<T> = std::result::Result<T, ReconcileError>;

/// Balance information returned by a successful source lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupPayload {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance_amount: Decimal,
    #[serde(default)]
    pub toll_bill_numbers: Vec<String>,
    #[serde(default)]
    pub violation_count: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct LookupFailure {
    pub reason: String,
}

impl LookupFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct NotificationFailure {
    pub reason: String,
}

impl NotificationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(
        "account needs either a NY account number and plate, or a NJ violation number and plate"
    )]
    IneligibleAccount,
}

/// Balance lookup against one toll source.
///
/// `identifier` is the NY account number or the NJ violation number. Timeouts
/// and retries, if any, are the implementation's business.
#[async_trait]
pub trait SourceLookup: Send + Sync {
    async fn lookup(
        &self,
        identifier: &str,
        plate_number: &str,
    ) -> std::result::Result<LookupPayload, LookupFailure>;
}

/// Delivers the merged record of a reconciliation to the account owner.
#[async_trait]
pub trait AccountNotifier: Send + Sync {
    async fn notify(
        &self,
        email: &str,
        record: &AccountRecord,
    ) -> std::result::Result<(), NotificationFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Every eligible source returned data.
    FullSuccess,
    /// Some eligible sources returned data, others failed.
    PartialSuccess,
    /// No eligible source returned data.
    TotalFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SourceStatus {
    Ineligible,
    Succeeded(LookupPayload),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source: Source,
    #[serde(flatten)]
    pub status: SourceStatus,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, SourceStatus::Succeeded(_))
    }

    pub fn failed(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }
}

/// A source that was queried and did not return data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceUnavailable {
    pub source: Source,
    pub reason: String,
}

impl fmt::Display for SourceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

/// What happened to the email notification of a reconciliation. Never
/// affects the [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Notification {
    /// No notifier attached.
    Disabled,
    /// The account has no email address.
    NoRecipient,
    /// No source returned data.
    NoData,
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub record: AccountRecord,
    pub outcome: Outcome,
    pub reports: Vec<SourceReport>,
    pub notification: Notification,
}

impl Reconciliation {
    pub fn report(&self, source: Source) -> Option<&SourceReport> {
        self.reports.iter().find(|r| r.source == source)
    }

    pub fn has_success(&self) -> bool {
        self.outcome != Outcome::TotalFailure
    }

    pub fn failures(&self) -> Vec<SourceUnavailable> {
        self.reports
            .iter()
            .filter_map(|r| match &r.status {
                SourceStatus::Failed { reason } => Some(SourceUnavailable {
                    source: r.source,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Error message per failed source. Succeeded and ineligible sources have
    /// no entry.
    pub fn errors(&self) -> BTreeMap<Source, String> {
        self.failures()
            .into_iter()
            .map(|f| (f.source, f.reason))
            .collect()
    }

    /// One-line description of the result, suitable for showing to the
    /// account owner.
    pub fn summary(&self) -> String {
        let breakdown = self
            .reports
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| {
                format!(
                    "{}: ${}",
                    r.source,
                    format_amount(self.record.balance_for(r.source))
                )
            })
            .collect::<Vec<_>>();
        let breakdown = if breakdown.is_empty() {
            String::new()
        } else {
            format!(" ({})", breakdown.join(" + "))
        };
        let total = format_amount(self.record.total_balance);

        let failures = self.failures();
        if !failures.is_empty() {
            let errors = failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            format!(
                "Some errors occurred: {}. Total Balance: ${}{}",
                errors, total, breakdown
            )
        } else {
            let mut summary = format!("Balance updated: ${}{}", total, breakdown);
            if let (Notification::Sent, Some(email)) = (&self.notification, self.record.email()) {
                summary.push_str(&format!(" - Email sent to {}", email));
            }
            summary
        }
    }
}

struct Stage<'a> {
    source: Source,
    lookup: &'a dyn SourceLookup,
}

impl<'a> Stage<'a> {
    async fn run(&self, record: &AccountRecord) -> SourceReport {
        let status = match record.query_for(self.source) {
            None => {
                tracing::trace!(
                    account = record.id.to_string(),
                    source = self.source.as_str(),
                    "source not eligible, skipping"
                );
                SourceStatus::Ineligible
            }
            Some((identifier, plate_number)) => {
                tracing::debug!(
                    account = record.id.to_string(),
                    source = self.source.as_str(),
                    "querying source"
                );
                match self.lookup.lookup(identifier, plate_number).await {
                    Ok(payload) => {
                        tracing::debug!(
                            account = record.id.to_string(),
                            source = self.source.as_str(),
                            balance = format_amount(payload.balance_amount),
                            bills = payload.toll_bill_numbers.len(),
                            "source returned balance"
                        );
                        SourceStatus::Succeeded(payload)
                    }
                    Err(e) => {
                        tracing::warn!(
                            account = record.id.to_string(),
                            source = self.source.as_str(),
                            "source lookup failed: {}",
                            e
                        );
                        SourceStatus::Failed { reason: e.reason }
                    }
                }
            }
        };

        SourceReport {
            source: self.source,
            status,
        }
    }
}

/// Ordered list of source stages. Each stage starts only once the previous
/// one has resolved.
pub struct Pipeline<'a> {
    stages: Vec<Stage<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(ny: &'a dyn SourceLookup, nj: &'a dyn SourceLookup) -> Self {
        Self {
            stages: vec![
                Stage {
                    source: Source::Ny,
                    lookup: ny,
                },
                Stage {
                    source: Source::Nj,
                    lookup: nj,
                },
            ],
        }
    }

    pub fn sources(&self) -> Vec<Source> {
        self.stages.iter().map(|s| s.source).collect()
    }

    /// Queries every eligible source and merges the results into `record`.
    ///
    /// Fails only when no source is eligible, in which case no lookup is made.
    /// The notification status of the result is [`Notification::Disabled`].
    pub async fn reconcile(&self, mut record: AccountRecord) -> Result<Reconciliation> {
        if !self.stages.iter().any(|s| record.is_eligible(s.source)) {
            return Err(ReconcileError::IneligibleAccount);
        }

        let mut reports = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            reports.push(stage.run(&record).await);
        }

        reject_out_of_range(&mut reports);
        merge(&mut record, &reports);
        let outcome = classify(&reports);

        tracing::info!(
            account = record.id.to_string(),
            outcome = format!("{:?}", outcome),
            ny_balance = format_amount(record.ny_balance),
            nj_balance = format_amount(record.nj_balance),
            total_balance = format_amount(record.total_balance),
            "account reconciled"
        );

        Ok(Reconciliation {
            record,
            outcome,
            reports,
            notification: Notification::Disabled,
        })
    }
}

/// Reconciles one account with the given lookups, without notification.
pub async fn reconcile(
    record: AccountRecord,
    ny: &dyn SourceLookup,
    nj: &dyn SourceLookup,
) -> Result<Reconciliation> {
    Pipeline::new(ny, nj).reconcile(record).await
}

/// Shareable reconciler: the two source lookups plus an optional notifier.
/// Holds no per-account state, so one instance may reconcile many accounts
/// concurrently.
#[derive(Clone)]
pub struct Reconciler {
    ny: Arc<dyn SourceLookup>,
    nj: Arc<dyn SourceLookup>,
    notifier: Option<Arc<dyn AccountNotifier>>,
}

impl Reconciler {
    pub fn new(ny: Arc<dyn SourceLookup>, nj: Arc<dyn SourceLookup>) -> Self {
        Self {
            ny,
            nj,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AccountNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn reconcile(&self, record: AccountRecord) -> Result<Reconciliation> {
        let mut reconciliation = Pipeline::new(self.ny.as_ref(), self.nj.as_ref())
            .reconcile(record)
            .await?;
        reconciliation.notification = self.notify(&reconciliation).await;
        Ok(reconciliation)
    }

    async fn notify(&self, reconciliation: &Reconciliation) -> Notification {
        let notifier = match &self.notifier {
            Some(notifier) => notifier,
            None => return Notification::Disabled,
        };
        let account = reconciliation.record.id.to_string();
        let email = match reconciliation.record.email() {
            Some(email) => email,
            None => {
                tracing::debug!(account = account, "no email address, notification not sent");
                return Notification::NoRecipient;
            }
        };
        if !reconciliation.has_success() {
            tracing::debug!(
                account = account,
                "no source returned data, notification not sent"
            );
            return Notification::NoData;
        }

        match notifier.notify(email, &reconciliation.record).await {
            Ok(()) => Notification::Sent,
            Err(e) => {
                tracing::error!(account = account, "failed to send notification: {}", e);
                Notification::Failed { reason: e.reason }
            }
        }
    }
}

/// Deduplicated union of bill number lists.
pub fn merge_bill_numbers<'a, I>(lists: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    lists
        .into_iter()
        .flat_map(|list| list.iter().cloned())
        .collect()
}

const OUT_OF_RANGE: &str = "balance or violation count out of range";

/// Marks a succeeded source as failed when adding its figures to those of the
/// sources before it would overflow.
fn reject_out_of_range(reports: &mut [SourceReport]) {
    let mut balance = Decimal::ZERO;
    let mut violations: u32 = 0;

    for report in reports.iter_mut() {
        let sums = match &report.status {
            SourceStatus::Succeeded(payload) => (
                balance.checked_add(payload.balance_amount),
                violations.checked_add(payload.violation_count),
            ),
            _ => continue,
        };
        match sums {
            (Some(next_balance), Some(next_violations)) => {
                balance = next_balance;
                violations = next_violations;
            }
            _ => {
                tracing::warn!(source = report.source.as_str(), "{}", OUT_OF_RANGE);
                report.status = SourceStatus::Failed {
                    reason: OUT_OF_RANGE.to_string(),
                };
            }
        }
    }
}

fn merge(record: &mut AccountRecord, reports: &[SourceReport]) {
    let succeeded = reports
        .iter()
        .filter_map(|r| match &r.status {
            SourceStatus::Succeeded(payload) => Some((r.source, payload)),
            _ => None,
        })
        .collect::<Vec<_>>();

    record.ny_balance = Decimal::ZERO;
    record.nj_balance = Decimal::ZERO;
    for (source, payload) in &succeeded {
        match source {
            Source::Ny => record.ny_balance = payload.balance_amount,
            Source::Nj => record.nj_balance = payload.balance_amount,
        }
    }
    record.total_balance = record.ny_balance.saturating_add(record.nj_balance);
    record.bill_numbers = merge_bill_numbers(
        succeeded
            .iter()
            .map(|(_, payload)| payload.toll_bill_numbers.as_slice()),
    );
    record.violation_count = succeeded
        .iter()
        .fold(0, |count: u32, (_, p)| count.saturating_add(p.violation_count));
    record.last_updated = Some(Local::now().format(LAST_UPDATED_FORMAT).to_string());
}

fn classify(reports: &[SourceReport]) -> Outcome {
    let succeeded = reports.iter().filter(|r| r.succeeded()).count();
    let failed = reports.iter().filter(|r| r.failed()).count();

    if failed == 0 {
        Outcome::FullSuccess
    } else if succeeded == 0 {
        Outcome::TotalFailure
    } else {
        Outcome::PartialSuccess
    }
}
