//! Client for the toll lookup backend, which drives the NY and NJ toll
//! websites and reports balances as JSON.

use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toll_core::{LookupFailure, LookupPayload, Source, SourceLookup};

use crate::mask;

pub type Result<T> = miette::Result<T, TollApiError>;

/// The backend drives a real browser session, so lookups are slow.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(300);

const FETCH_NY_ACCOUNT_ENDPOINT: &str = "/api/fetch-single-account";
const FETCH_NJ_VIOLATION_ENDPOINT: &str = "/api/fetch-nj-violation";
const DEFAULT_FAILURE_REASON: &str = "Failed to fetch";

#[derive(Clone)]
pub struct TollApiClient {
    base_url: url::Url,
    client: reqwest::Client,
}

#[derive(Error, Diagnostic, Debug)]
pub enum TollApiError {
    #[error("failed to create HTTP client: {0}")]
    #[diagnostic(code(toll::lookup::client))]
    ClientBuildError(reqwest::Error),
    #[error("failed to create HTTP request: {0}")]
    #[diagnostic(code(toll::lookup::request))]
    RequestBuildError(reqwest::Error),
    #[error("failed to execute HTTP request: {0}")]
    #[diagnostic(code(toll::lookup::request))]
    RequestError(reqwest::Error),
    #[error("failed to parse lookup response: {0}")]
    #[diagnostic(code(toll::lookup::response))]
    ResponseParseError(serde_json::Error),
    #[error("failed to parse lookup API URL: {0}")]
    #[diagnostic(code(toll::config::invalid))]
    UrlParsingError(url::ParseError),
    #[error("{0}")]
    #[diagnostic(code(toll::lookup::remote))]
    ApiError(String),
    #[error("lookup failed with HTTP status {0}: {1}")]
    #[diagnostic(code(toll::lookup::http))]
    ApiHttpError(StatusCode, String),
}

#[derive(Debug, Serialize)]
struct FetchNyAccountRequest<'a> {
    account_number: &'a str,
    plate_number: &'a str,
    source: &'static str,
}

#[derive(Debug, Serialize)]
struct FetchNjViolationRequest<'a> {
    violation_number: &'a str,
    plate_number: &'a str,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    balance_amount: Option<Decimal>,
    #[serde(default)]
    toll_bill_numbers: Option<Vec<String>>,
    #[serde(default)]
    violation_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl TollApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TollApiError::ClientBuildError)?;
        let base_url: url::Url = base_url.parse().map_err(TollApiError::UrlParsingError)?;

        Ok(Self { base_url, client })
    }

    pub async fn fetch_ny_account(
        &self,
        account_number: &str,
        plate_number: &str,
    ) -> Result<LookupPayload> {
        tracing::debug!(
            account_number = mask::identifier(account_number),
            plate_number = mask::identifier(plate_number),
            "fetching NY account balance"
        );
        let request = FetchNyAccountRequest {
            account_number,
            plate_number,
            source: Source::Ny.as_str(),
        };
        self.fetch(FETCH_NY_ACCOUNT_ENDPOINT, &request).await
    }

    pub async fn fetch_nj_violation(
        &self,
        violation_number: &str,
        plate_number: &str,
    ) -> Result<LookupPayload> {
        tracing::debug!(
            violation_number = mask::identifier(violation_number),
            plate_number = mask::identifier(plate_number),
            "fetching NJ violation balance"
        );
        let request = FetchNjViolationRequest {
            violation_number,
            plate_number,
        };
        self.fetch(FETCH_NJ_VIOLATION_ENDPOINT, &request).await
    }

    async fn fetch<RQ: Serialize>(&self, endpoint: &str, request: &RQ) -> Result<LookupPayload> {
        let req = self
            .client
            .request(
                Method::POST,
                self.base_url
                    .join(endpoint)
                    .map_err(TollApiError::UrlParsingError)?,
            )
            .json(request)
            .build()
            .map_err(TollApiError::RequestBuildError)?;

        let resp = self
            .client
            .execute(req)
            .await
            .map_err(TollApiError::RequestError)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(TollApiError::RequestError)?;

        if !status.is_success() {
            // error responses usually still carry the JSON error message
            if let Ok(FetchResponse {
                error: Some(error), ..
            }) = serde_json::from_slice(&body)
            {
                return Err(TollApiError::ApiError(error));
            }
            return Err(TollApiError::ApiHttpError(
                status,
                String::from_utf8_lossy(&body).to_string(),
            ));
        }

        let response: FetchResponse =
            serde_json::from_slice(&body).map_err(TollApiError::ResponseParseError)?;

        if !response.success {
            return Err(TollApiError::ApiError(
                response
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
            ));
        }

        Ok(LookupPayload {
            balance_amount: response.balance_amount.unwrap_or_default(),
            toll_bill_numbers: response.toll_bill_numbers.unwrap_or_default(),
            violation_count: response.violation_count.unwrap_or_default(),
        })
    }
}

/// NY account lookups through the backend.
#[derive(Clone)]
pub struct NyLookup(pub TollApiClient);

/// NJ violation lookups through the backend.
#[derive(Clone)]
pub struct NjLookup(pub TollApiClient);

#[async_trait]
impl SourceLookup for NyLookup {
    async fn lookup(
        &self,
        identifier: &str,
        plate_number: &str,
    ) -> std::result::Result<LookupPayload, LookupFailure> {
        self.0
            .fetch_ny_account(identifier, plate_number)
            .await
            .map_err(|e| LookupFailure::new(e.to_string()))
    }
}

#[async_trait]
impl SourceLookup for NjLookup {
    async fn lookup(
        &self,
        identifier: &str,
        plate_number: &str,
    ) -> std::result::Result<LookupPayload, LookupFailure> {
        self.0
            .fetch_nj_violation(identifier, plate_number)
            .await
            .map_err(|e| LookupFailure::new(e.to_string()))
    }
}
