use chrono::{DateTime, Utc};
use miette::Diagnostic;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::mask;

pub type Result<T> = miette::Result<T, PostmarkError>;

pub const POSTMARK_API_TOKEN_ENV: &str = "POSTMARK_API_TOKEN";
pub const POSTMARK_API_BASE_URL: &str = "https://api.postmarkapp.com";
const POSTMARK_API_ENDPOINT_EMAIL: &str = "/email";
const POSTMARK_API_TOKEN_HEADER: &str = "X-Postmark-Server-Token";
const POSTMARK_API_TEST_TOKEN: &str = "POSTMARK_API_TEST";

#[derive(Clone)]
pub struct PostmarkClient {
    token: String,
    api_base_url: url::Url,
    client: reqwest::Client,
}

#[derive(Error, Diagnostic, Debug)]
pub enum PostmarkError {
    #[error("expected Postmark token in POSTMARK_API_TOKEN environment variable")]
    #[diagnostic(code(toll::config::invalid))]
    MissingToken,
    #[error("failed to create HTTP client: {0}")]
    ClientBuildError(reqwest::Error),
    #[error("failed to create HTTP request: {0}")]
    RequestBuildError(reqwest::Error),
    #[error("failed to execute HTTP request: {0}")]
    RequestError(reqwest::Error),
    #[error("failed to parse API response: {0}")]
    ResponseParseError(serde_json::Error),
    #[error("failed to parse API URL: {0}")]
    UrlParsingError(url::ParseError),
    #[error("failed to send email using Postmark: {1} ({0})")]
    ApiError(i32, String),
    #[error("HTTP error sending email using Postmark: {1} ({0})")]
    ApiHttpError(StatusCode, String),
}

impl PostmarkClient {
    /// Creates a client for the Postmark API at `api_base_url` using the
    /// server token in the `POSTMARK_API_TOKEN` environment variable.
    pub fn from_env(api_base_url: &str) -> Result<Self> {
        let token =
            std::env::var(POSTMARK_API_TOKEN_ENV).map_err(|_| PostmarkError::MissingToken)?;
        Self::new(&token, api_base_url)
    }

    pub fn new(token: &str, api_base_url: &str) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(PostmarkError::MissingToken);
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(PostmarkError::ClientBuildError)?;
        let api_base_url: url::Url = api_base_url
            .parse()
            .map_err(PostmarkError::UrlParsingError)?;

        if token == POSTMARK_API_TEST_TOKEN {
            tracing::warn!(
                "the Postmark token is the API test token, emails will not actually be sent"
            );
        }

        Ok(Self {
            token: token.to_string(),
            api_base_url,
            client,
        })
    }

    pub async fn send_email(&self, request: &SendEmailRequest) -> Result<SendEmailResponse> {
        let req = self
            .client
            .request(
                Method::POST,
                self.api_base_url
                    .join(POSTMARK_API_ENDPOINT_EMAIL)
                    .map_err(PostmarkError::UrlParsingError)?,
            )
            .header(POSTMARK_API_TOKEN_HEADER, &self.token)
            .json(request)
            .build()
            .map_err(PostmarkError::RequestBuildError)?;

        let resp = self
            .client
            .execute(req)
            .await
            .map_err(PostmarkError::RequestError)?;

        let status = resp.status();

        let response_body_bytes = resp.bytes().await.map_err(PostmarkError::RequestError)?;

        if !status.is_success() {
            return Err(PostmarkError::ApiHttpError(
                status,
                String::from_utf8_lossy(&response_body_bytes).to_string(),
            ));
        }

        let api_response: SendEmailResponse = serde_json::from_slice(&response_body_bytes)
            .map_err(PostmarkError::ResponseParseError)?;

        if api_response.error_code != 0 {
            return Err(PostmarkError::ApiError(
                api_response.error_code,
                api_response.message,
            ));
        }

        if tracing::event_enabled!(Level::DEBUG) {
            let emails = request
                .to
                .split(',')
                .map(|e| mask::email(e.trim()))
                .collect::<Vec<_>>()
                .join(", ");
            let subject = request.subject.as_deref().unwrap_or("");
            tracing::debug!(
                emails = emails,
                subject = subject,
                message_id = api_response.message_id.as_deref().unwrap_or(""),
                "emails sent"
            );
        }

        Ok(api_response)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SendEmailRequest {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendEmailResponse {
    pub error_code: i32,
    pub message: String,
    #[serde(rename = "MessageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    pub to: Option<String>,
}
