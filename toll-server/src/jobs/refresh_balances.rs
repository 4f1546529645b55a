use std::time::Duration;

use tokio::{sync::oneshot, task::JoinHandle, time};
use toll_core::Reconciler;

use crate::store::AccountStore;

pub struct RefreshBalances {
    store: AccountStore,
    reconciler: Reconciler,
    refresh_interval: Duration,
    account_delay: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

/// Counts of one pass over all accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RefreshSummary {
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

impl RefreshBalances {
    pub fn new(
        store: AccountStore,
        reconciler: Reconciler,
        refresh_interval: Duration,
        account_delay: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            refresh_interval,
            account_delay,
            shutdown_tx: None,
            join_handle: None,
        }
    }

    pub async fn spawn(&mut self) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        // the first pass runs one interval after startup
        let period = self.refresh_interval.max(Duration::from_secs(1));
        let mut refresh_interval = time::interval_at(time::Instant::now() + period, period);
        refresh_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let store = self.store.clone();
        let reconciler = self.reconciler.clone();
        let account_delay = self.account_delay;

        tracing::debug!(
            interval_secs = period.as_secs(),
            account_delay_secs = account_delay.as_secs(),
            "starting RefreshBalances job"
        );

        self.shutdown_tx = Some(shutdown_tx);
        self.join_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = refresh_interval.tick() => {
                        tokio::select! {
                            _ = refresh_all(&store, &reconciler, account_delay) => {},
                            _msg = &mut shutdown_rx => {
                                tracing::info!("balance refresh interrupted by shutdown");
                                break;
                            }
                        }
                    },
                    _msg = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if let Some(tx) = self.shutdown_tx.take() {
                if tx.send(()).is_err() {
                    tracing::error!("failed to send RefreshBalances job shutdown signal");
                }
            }
            if let Err(e) = handle.await {
                tracing::error!("failed to wait for RefreshBalances job to terminate: {}", e);
            }
        }

        tracing::debug!("finished RefreshBalances job");
    }
}

/// Reconciles every stored account, one at a time, waiting `account_delay`
/// between accounts. Results are persisted when at least one source returned
/// data.
pub async fn refresh_all(
    store: &AccountStore,
    reconciler: &Reconciler,
    account_delay: Duration,
) -> RefreshSummary {
    let accounts = store.list().await;
    let mut summary = RefreshSummary::default();

    tracing::info!(accounts = accounts.len(), "refreshing account balances");

    let mut first = true;
    for account in accounts {
        if !account.is_reconcilable() {
            tracing::debug!(
                account = account.id.to_string(),
                "account has no complete identity, skipping"
            );
            summary.skipped += 1;
            continue;
        }

        if !first && !account_delay.is_zero() {
            time::sleep(account_delay).await;
        }
        first = false;

        let id = account.id;
        match reconciler.reconcile(account).await {
            Ok(reconciliation) if reconciliation.has_success() => {
                match store.save_reconciliation(&reconciliation.record).await {
                    Ok(_) => summary.successful += 1,
                    Err(e) => {
                        tracing::error!(
                            account = id.to_string(),
                            "failed to save refreshed balance: {}",
                            e
                        );
                        summary.failed += 1;
                    }
                }
            }
            Ok(reconciliation) => {
                tracing::warn!(
                    account = id.to_string(),
                    "no source returned data: {}",
                    reconciliation.summary()
                );
                summary.failed += 1;
            }
            Err(e) => {
                tracing::warn!(account = id.to_string(), "failed to reconcile: {}", e);
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        "balance refresh complete: {} successful, {} failed out of {}",
        summary.successful,
        summary.failed,
        summary.total()
    );

    summary
}
