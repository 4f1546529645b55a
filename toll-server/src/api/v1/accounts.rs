use std::collections::BTreeMap;
use std::collections::BTreeSet;

use axum::body::Empty;
use axum::response::IntoResponse;
use axum::{extract::Path, Extension};
use miette::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use toll_core::{AccountRecord, Notification, Outcome, Reconciler, Source};

use crate::api::v1::ApiError;
use crate::api::Json;
use crate::shortid::ShortId;
use crate::store::{AccountStore, AccountUpdate, NewAccount};

/// Handler for `GET /api/v1/accounts`
pub async fn read_all(
    Extension(store): Extension<AccountStore>,
) -> Result<Json<Vec<Account>>, ApiError> {
    let accounts: Vec<Account> = store.list().await.into_iter().map(|a| a.into()).collect();
    Ok(accounts.into())
}

/// Handler for `GET /api/v1/accounts/:id`
pub async fn read_one(
    Path(id): Path<ShortId>,
    Extension(store): Extension<AccountStore>,
) -> Result<Json<Account>, ApiError> {
    let account: Account = store.get(id.as_uuid()).await?.into();
    Ok(account.into())
}

/// Handler for `POST /api/v1/accounts`
pub async fn create(
    Extension(store): Extension<AccountStore>,
    Json(request): Json<NewAccount>,
) -> Result<Json<Account>, ApiError> {
    let account: Account = store.add(request).await?.into();
    Ok(account.into())
}

/// Handler for `PATCH /api/v1/accounts/:id`
pub async fn update(
    Path(id): Path<ShortId>,
    Extension(store): Extension<AccountStore>,
    Json(request): Json<AccountUpdate>,
) -> Result<Json<Account>, ApiError> {
    let account: Account = store.update(id.as_uuid(), request).await?.into();
    Ok(account.into())
}

/// Handler for `DELETE /api/v1/accounts/:id`
pub async fn delete(
    Path(id): Path<ShortId>,
    Extension(store): Extension<AccountStore>,
) -> Result<impl IntoResponse, ApiError> {
    store.delete(id.as_uuid()).await?;
    Ok(Empty::new())
}

/// Handler for `POST /api/v1/accounts/:id/refresh`
///
/// Queries the sources now and stores the merged balances, whatever the
/// outcome.
pub async fn refresh(
    Path(id): Path<ShortId>,
    Extension(store): Extension<AccountStore>,
    Extension(reconciler): Extension<Reconciler>,
) -> Result<Json<RefreshResult>, ApiError> {
    let record = store.get(id.as_uuid()).await?;
    let reconciliation = reconciler.reconcile(record).await?;
    let stored = store.save_reconciliation(&reconciliation.record).await?;

    Ok(RefreshResult {
        outcome: reconciliation.outcome,
        errors: reconciliation.errors(),
        summary: reconciliation.summary(),
        notification: reconciliation.notification,
        account: stored.into(),
    }
    .into())
}

/// Conversion from stored [`AccountRecord`] to API [`Account`].
impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Self {
            id: record.id.into(),
            sources: record.sources,
            account_number: record.account_number,
            plate_number: record.plate_number,
            violation_number: record.violation_number,
            nj_plate_number: record.nj_plate_number,
            email: record.email,
            ny_balance: record.ny_balance,
            nj_balance: record.nj_balance,
            total_balance: record.total_balance,
            bill_numbers: record.bill_numbers.into_iter().collect(),
            violation_count: record.violation_count,
            last_updated: record.last_updated,
        }
    }
}

/// An API [`Account`] type.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: ShortId,
    pub sources: BTreeSet<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nj_plate_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub ny_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub nj_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_balance: Decimal,
    pub bill_numbers: Vec<String>,
    pub violation_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Response of `POST /api/v1/accounts/:id/refresh`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub account: Account,
    pub outcome: Outcome,
    pub errors: BTreeMap<Source, String>,
    pub summary: String,
    pub notification: Notification,
}
