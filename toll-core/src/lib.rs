pub mod account;
pub mod reconcile;
pub mod source;

pub use account::{AccountRecord, NjIdentity, NyIdentity};
pub use reconcile::{
    reconcile, AccountNotifier, LookupFailure, LookupPayload, Notification, NotificationFailure,
    Outcome, Pipeline, ReconcileError, Reconciler, Reconciliation, SourceLookup, SourceReport,
    SourceStatus, SourceUnavailable,
};
pub use source::Source;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(
        "account must have either NY (account number + plate) or NJ (violation number + plate)"
    )]
    MissingIdentity,
    #[error("{0} is required for {1} accounts")]
    MissingField(&'static str, Source),
    #[error("unsupported toll source '{0}', expected NY or NJ")]
    UnsupportedSource(String),
}
