use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use camino::Utf8PathBuf;
use dotenv::dotenv;
use miette::{Diagnostic, IntoDiagnostic, Result};
use thiserror::Error;
use toll_core::Reconciler;
use tracing_subscriber::EnvFilter;

use crate::integrations::postmark::{PostmarkClient, PostmarkError, POSTMARK_API_BASE_URL};
use crate::integrations::tolls::{
    NjLookup, NyLookup, TollApiClient, TollApiError, DEFAULT_LOOKUP_TIMEOUT,
};
use crate::notifier::{Notifier, NotifierError, DEFAULT_SENDER};
use crate::store::{AccountStore, StoreError};
use crate::{api, jobs};

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub const NOTIFICATION_FROM_ENV: &str = "NOTIFICATION_FROM";

pub struct App {
    args: Args,
}

#[derive(Error, Diagnostic, Debug)]
pub enum AppError {
    #[error("failed to load accounts: {0}")]
    #[diagnostic(code(toll::error::store))]
    Store(#[from] StoreError),
    #[error("lookup client configuration error: {0}")]
    #[diagnostic(code(toll::error::configuration))]
    LookupClient(#[from] TollApiError),
    #[error("email configuration error: {0}")]
    #[diagnostic(
        code(toll::error::configuration),
        help("set POSTMARK_API_TOKEN, or use POSTMARK_API_TEST to send nothing")
    )]
    Postmark(#[from] PostmarkError),
    #[error("notifier configuration error: {0}")]
    #[diagnostic(code(toll::error::configuration))]
    Notifier(#[from] NotifierError),
}

impl App {
    pub fn new() -> Self {
        Self::with_args(argh::from_env())
    }

    pub fn with_args(args: Args) -> Self {
        Self { args }
    }

    pub fn json_output() -> bool {
        JSON_OUTPUT.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> Result<()> {
        dotenv().ok();

        miette::set_panic_hook();

        if std::env::var_os("RUST_BACKTRACE").is_none() {
            std::env::set_var("RUST_BACKTRACE", "1")
        }

        if std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var("RUST_LOG", "toll_server=debug,toll_core=debug")
        }

        if self.args.json {
            JSON_OUTPUT.store(true, Ordering::Relaxed);
            tracing_subscriber::fmt::fmt()
                .json()
                .with_env_filter(EnvFilter::from_default_env())
                .try_init()
                .ok();
        } else {
            JSON_OUTPUT.store(false, Ordering::Relaxed);
            tracing_subscriber::fmt::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .try_init()
                .ok();
        }

        let store = AccountStore::open(&self.args.accounts_file)
            .await
            .map_err(AppError::Store)?;

        let lookup_client = TollApiClient::new(&self.args.lookup_url, DEFAULT_LOOKUP_TIMEOUT)
            .map_err(AppError::LookupClient)?;
        tracing::debug!(url = self.args.lookup_url.as_str(), "using toll lookup backend");
        tracing::debug!(url = self.args.postmark_url.as_str(), "using Postmark API");

        let postmark_client =
            PostmarkClient::from_env(&self.args.postmark_url).map_err(AppError::Postmark)?;
        let sender =
            std::env::var(NOTIFICATION_FROM_ENV).unwrap_or_else(|_| DEFAULT_SENDER.to_string());
        let notifier = Notifier::new(postmark_client, &sender).map_err(AppError::Notifier)?;

        let reconciler = Reconciler::new(
            Arc::new(NyLookup(lookup_client.clone())),
            Arc::new(NjLookup(lookup_client)),
        )
        .with_notifier(Arc::new(notifier));

        let mut refresh_balances_job: Option<jobs::RefreshBalances> = None;

        if !self.args.disable_background_jobs {
            refresh_balances_job = Some(jobs::RefreshBalances::new(
                store.clone(),
                reconciler.clone(),
                Duration::from_secs(self.args.refresh_interval),
                Duration::from_secs(self.args.account_delay),
            ));
        } else {
            tracing::debug!("background jobs disabled, balances will only refresh on request");
        }

        let router = api::build(store, reconciler);

        tracing::debug!(
            ip = self.args.listen_address.ip().to_string().as_str(),
            port = self.args.listen_address.port(),
            url = format!(
                "http://{}:{}",
                self.args.listen_address.ip(),
                self.args.listen_address.port()
            ),
            "server started"
        );

        if let Some(job) = refresh_balances_job.as_mut() {
            job.spawn().await;
        }

        let server = axum::Server::bind(&self.args.listen_address)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>());

        let graceful =
            server.with_graceful_shutdown(shutdown_signal(refresh_balances_job.as_mut()));
        graceful.await.into_diagnostic()?;

        tracing::debug!("server terminated");

        Ok(())
    }
}

async fn shutdown_signal(refresh_balances_job: Option<&mut jobs::RefreshBalances>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("ctrl-c received");

    if let Some(job) = refresh_balances_job {
        job.stop().await;
    }
}

#[derive(FromArgs)]
/// Toll balance reconciliation server.
pub struct Args {
    /// server address:port to listen on (default: 0.0.0.0:8080, PORT environment variable can override default port 8080)
    #[argh(
        option,
        default = "SocketAddr::from(([0, 0, 0, 0], default_listen_port()))"
    )]
    pub listen_address: SocketAddr,
    /// path of the JSON accounts file (default: accounts_config.json, or ACCOUNTS_FILE environment variable)
    #[argh(option, default = "default_accounts_file()")]
    pub accounts_file: Utf8PathBuf,
    /// base URL of the toll lookup backend (default: http://127.0.0.1:5000, or TOLL_LOOKUP_URL environment variable)
    #[argh(option, default = "default_lookup_url()")]
    pub lookup_url: String,
    /// base URL of the Postmark API (default: https://api.postmarkapp.com, or POSTMARK_API_URL environment variable)
    #[argh(option, default = "default_postmark_url()")]
    pub postmark_url: String,
    /// seconds between balance refreshes of all accounts (default: 10800, or REFRESH_INTERVAL_SECS environment variable)
    #[argh(option, default = "default_secs(\"REFRESH_INTERVAL_SECS\", DEFAULT_REFRESH_INTERVAL_SECS)")]
    pub refresh_interval: u64,
    /// seconds to wait between accounts during a refresh (default: 15, or ACCOUNT_DELAY_SECS environment variable)
    #[argh(option, default = "default_secs(\"ACCOUNT_DELAY_SECS\", DEFAULT_ACCOUNT_DELAY_SECS)")]
    pub account_delay: u64,
    /// use JSON for log messages
    #[argh(switch)]
    pub json: bool,
    /// disable background jobs
    #[argh(switch)]
    pub disable_background_jobs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], default_listen_port())),
            accounts_file: default_accounts_file(),
            lookup_url: default_lookup_url(),
            postmark_url: default_postmark_url(),
            refresh_interval: default_secs("REFRESH_INTERVAL_SECS", DEFAULT_REFRESH_INTERVAL_SECS),
            account_delay: default_secs("ACCOUNT_DELAY_SECS", DEFAULT_ACCOUNT_DELAY_SECS),
            json: false,
            disable_background_jobs: false,
        }
    }
}

const DEFAULT_LISTEN_PORT: u16 = 8080;

fn default_listen_port() -> u16 {
    if let Ok(port_str) = std::env::var("PORT") {
        if let Ok(port) = port_str.parse() {
            tracing::debug!("using port from PORT environment variable");
            port
        } else {
            DEFAULT_LISTEN_PORT
        }
    } else {
        DEFAULT_LISTEN_PORT
    }
}

const DEFAULT_ACCOUNTS_FILE: &str = "accounts_config.json";

fn default_accounts_file() -> Utf8PathBuf {
    std::env::var("ACCOUNTS_FILE")
        .unwrap_or_else(|_| DEFAULT_ACCOUNTS_FILE.to_string())
        .into()
}

const DEFAULT_LOOKUP_URL: &str = "http://127.0.0.1:5000";

fn default_lookup_url() -> String {
    if let Ok(value) = std::env::var("TOLL_LOOKUP_URL") {
        value
    } else {
        DEFAULT_LOOKUP_URL.to_string()
    }
}

fn default_postmark_url() -> String {
    std::env::var("POSTMARK_API_URL").unwrap_or_else(|_| POSTMARK_API_BASE_URL.to_string())
}

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3 * 60 * 60;
const DEFAULT_ACCOUNT_DELAY_SECS: u64 = 15;

fn default_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
