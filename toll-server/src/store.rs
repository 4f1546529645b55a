//! Persistent account list, kept as a single JSON document on disk.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use toll_core::{AccountRecord, Source};
use uuid::Uuid;

use crate::mask;
use crate::shortid::ShortId;

const ARCHIVED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type Result<T> = miette::Result<T, StoreError>;

#[derive(Error, Diagnostic, Debug)]
pub enum StoreError {
    #[error("failed to read accounts file {path}: {source}")]
    #[diagnostic(code(toll::store::read))]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write accounts file {path}: {source}")]
    #[diagnostic(code(toll::store::write))]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("accounts file {path} is not valid JSON: {source}")]
    #[diagnostic(
        code(toll::store::parse),
        help("fix or remove the file, it is recreated on the next write")
    )]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize accounts: {0}")]
    #[diagnostic(code(toll::store::serialize))]
    Serialize(#[source] serde_json::Error),
    #[error("account {} does not exist", ShortId::from(.0))]
    #[diagnostic(code(toll::store::not_found))]
    NotFound(Uuid),
    #[error("{0} account already exists")]
    #[diagnostic(code(toll::store::conflict))]
    Conflict(Source),
    #[error("{0}")]
    #[diagnostic(code(toll::store::invalid_account))]
    InvalidAccount(#[from] toll_core::Error),
}

/// On-disk layout of the accounts file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFile {
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default, alias = "archived_accounts")]
    pub archived_accounts: Vec<ArchivedAccount>,
}

/// A previous version of an account, kept after it was merged into another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedAccount {
    #[serde(flatten)]
    pub account: AccountRecord,
    #[serde(alias = "archived_at")]
    pub archived_at: String,
    #[serde(default, alias = "archived_reason", skip_serializing_if = "Option::is_none")]
    pub archived_reason: Option<String>,
}

/// Body for adding an account of one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Partial edit of an account. Absent fields are left alone, empty strings
/// clear the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nj_plate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Normalized identity of a [`NewAccount`].
struct Identity {
    source: Source,
    identifier: String,
    plate_number: String,
    email: Option<String>,
}

impl NewAccount {
    fn normalize(&self) -> Result<Identity> {
        let (field, identifier) = match self.source {
            Source::Ny => ("account number", &self.account_number),
            Source::Nj => ("violation number", &self.violation_number),
        };
        let identifier = upper(identifier)
            .ok_or(toll_core::Error::MissingField(field, self.source))?;
        let plate_number = upper(&self.plate_number)
            .ok_or(toll_core::Error::MissingField("plate number", self.source))?;

        Ok(Identity {
            source: self.source,
            identifier,
            plate_number,
            email: lower(&self.email),
        })
    }
}

impl Identity {
    fn matches(&self, record: &AccountRecord) -> bool {
        record.query_for(self.source).map_or(false, |(identifier, plate_number)| {
            identifier.eq_ignore_ascii_case(&self.identifier)
                && plate_number.eq_ignore_ascii_case(&self.plate_number)
        })
    }

    fn apply_to(&self, record: &mut AccountRecord) {
        match self.source {
            Source::Ny => {
                // the shared plate may be the only NJ plate on older records
                if record.nj_identity().is_some() && record.nj_plate_number.is_none() {
                    record.nj_plate_number = record.plate_number.clone();
                }
                record.account_number = Some(self.identifier.clone());
                record.plate_number = Some(self.plate_number.clone());
            }
            Source::Nj => {
                record.violation_number = Some(self.identifier.clone());
                record.nj_plate_number = Some(self.plate_number.clone());
            }
        }
        record.sync_sources();
    }

    fn into_record(self) -> AccountRecord {
        let mut record = match self.source {
            Source::Ny => AccountRecord::new_ny(&self.identifier, &self.plate_number),
            Source::Nj => AccountRecord::new_nj(&self.identifier, &self.plate_number),
        };
        record.email = self.email;
        record
    }
}

/// Account list shared between the API and the refresh job.
#[derive(Clone)]
pub struct AccountStore {
    path: Utf8PathBuf,
    state: Arc<Mutex<AccountsFile>>,
}

impl AccountStore {
    /// Loads the accounts file at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut state: AccountsFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                for account in state.accounts.iter_mut() {
                    if account.sources.is_empty() {
                        account.sync_sources();
                    }
                }
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = path.as_str(), "accounts file not found, starting empty");
                AccountsFile::default()
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        tracing::debug!(
            path = path.as_str(),
            accounts = state.accounts.len(),
            archived = state.archived_accounts.len(),
            "accounts loaded"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<AccountRecord> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn archived(&self) -> Vec<ArchivedAccount> {
        self.state.lock().await.archived_accounts.clone()
    }

    pub async fn get(&self, id: &Uuid) -> Result<AccountRecord> {
        self.state
            .lock()
            .await
            .accounts
            .iter()
            .find(|a| &a.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    /// Adds an account of one source.
    ///
    /// An existing account with the same identity is a conflict; its email
    /// is updated if a different one was given. Otherwise, active accounts
    /// sharing the email are folded into one record carrying the new
    /// identity, and their previous versions archived.
    pub async fn add(&self, new_account: NewAccount) -> Result<AccountRecord> {
        let identity = new_account.normalize()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.accounts.iter_mut().find(|a| identity.matches(a)) {
            match &identity.email {
                Some(email) if existing.email.as_deref() != Some(email.as_str()) => {
                    existing.email = Some(email.clone());
                    tracing::info!(
                        account = existing.id.to_string(),
                        email = mask::email(email),
                        "updated email of existing account"
                    );
                    self.persist(&state).await?;
                }
                _ => {}
            }
            return Err(StoreError::Conflict(identity.source));
        }

        let same_email = match &identity.email {
            Some(email) => state
                .accounts
                .iter()
                .enumerate()
                .filter(|(_, a)| a.email().map_or(false, |e| e.eq_ignore_ascii_case(email)))
                .map(|(i, _)| i)
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };

        let record = if same_email.is_empty() {
            let record = identity.into_record();
            tracing::info!(
                account = record.id.to_string(),
                source = new_account.source.as_str(),
                "account added"
            );
            state.accounts.push(record.clone());
            record
        } else {
            let archived_at = Local::now().format(ARCHIVED_AT_FORMAT).to_string();
            let email = identity.email.clone().unwrap_or_default();

            let mut merged = state.accounts[same_email[0]].clone();
            identity.apply_to(&mut merged);
            merged.email = Some(email.clone());

            let mut archived = Vec::with_capacity(same_email.len());
            for (n, index) in same_email.iter().enumerate() {
                let old = &state.accounts[*index];
                if n > 0 {
                    fill_missing_identity(&mut merged, old);
                }
                let reason = if n == 0 {
                    format!(
                        "Merged with new {} account (same email: {})",
                        identity.source, email
                    )
                } else {
                    format!("Merged with account (same email: {})", email)
                };
                archived.push(ArchivedAccount {
                    account: old.clone(),
                    archived_at: archived_at.clone(),
                    archived_reason: Some(reason),
                });
            }
            merged.sync_sources();

            for index in same_email.iter().rev() {
                state.accounts.remove(*index);
            }
            state.archived_accounts.extend(archived);
            state.accounts.push(merged.clone());

            tracing::info!(
                account = merged.id.to_string(),
                source = identity.source.as_str(),
                email = mask::email(&email),
                archived = same_email.len(),
                "account merged by email"
            );
            merged
        };

        self.persist(&state).await?;

        Ok(record)
    }

    pub async fn update(&self, id: &Uuid, update: AccountUpdate) -> Result<AccountRecord> {
        let mut state = self.state.lock().await;
        let index = state
            .accounts
            .iter()
            .position(|a| &a.id == id)
            .ok_or(StoreError::NotFound(*id))?;

        let mut record = state.accounts[index].clone();
        if let Some(value) = &update.account_number {
            record.account_number = upper(&Some(value.clone()));
        }
        if let Some(value) = &update.plate_number {
            record.plate_number = upper(&Some(value.clone()));
        }
        if let Some(value) = &update.violation_number {
            record.violation_number = upper(&Some(value.clone()));
        }
        if let Some(value) = &update.nj_plate_number {
            record.nj_plate_number = upper(&Some(value.clone()));
        }
        if let Some(value) = &update.email {
            record.email = lower(&Some(value.clone()));
        }
        record.validate()?;
        record.sync_sources();

        state.accounts[index] = record.clone();
        self.persist(&state).await?;

        tracing::info!(account = id.to_string(), "account updated");

        Ok(record)
    }

    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let index = state
            .accounts
            .iter()
            .position(|a| &a.id == id)
            .ok_or(StoreError::NotFound(*id))?;
        state.accounts.remove(index);
        self.persist(&state).await?;

        tracing::info!(account = id.to_string(), "account deleted");

        Ok(())
    }

    /// Stores the derived fields of a reconciled record. Identity edits made
    /// while the lookups ran are kept.
    pub async fn save_reconciliation(&self, record: &AccountRecord) -> Result<AccountRecord> {
        let mut state = self.state.lock().await;
        let stored = state
            .accounts
            .iter_mut()
            .find(|a| a.id == record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        stored.copy_balances_from(record);
        let stored = stored.clone();
        self.persist(&state).await?;
        Ok(stored)
    }

    async fn persist(&self, state: &AccountsFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(StoreError::Serialize)?;
        let temp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        tracing::trace!(path = self.path.as_str(), "accounts file written");

        Ok(())
    }
}

fn fill_missing_identity(merged: &mut AccountRecord, old: &AccountRecord) {
    fn fill(target: &mut Option<String>, value: &Option<String>) {
        if target.as_deref().map_or(true, |s| s.trim().is_empty()) && value.is_some() {
            *target = value.clone();
        }
    }

    fill(&mut merged.account_number, &old.account_number);
    fill(&mut merged.plate_number, &old.plate_number);
    fill(&mut merged.ny_plate_number, &old.ny_plate_number);
    fill(&mut merged.violation_number, &old.violation_number);
    fill(&mut merged.nj_plate_number, &old.nj_plate_number);
}

fn upper(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
}

fn lower(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}
