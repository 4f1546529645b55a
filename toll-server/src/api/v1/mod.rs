use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use toll_core::ReconcileError;

use crate::{api::Json, app::App, store::StoreError};

use super::{ReportRenderer, ReportType};

pub mod accounts;

#[derive(Error, Diagnostic, Debug)]
pub enum ApiError {
    #[error(transparent)]
    #[diagnostic(code(toll::error::store))]
    Store(#[from] StoreError),
    #[error(transparent)]
    #[diagnostic(code(toll::error::reconcile))]
    Reconcile(#[from] ReconcileError),
}

pub const ACCOUNTS_URI: &str = "/api/v1/accounts";
pub const HEALTH_URI: &str = "/health";

pub fn router() -> Router {
    Router::new()
        .route(HEALTH_URI, get(health_handler))
        .route(
            ACCOUNTS_URI,
            get(accounts::read_all).post(accounts::create),
        )
        .route(
            &format!("{}/:id", ACCOUNTS_URI),
            get(accounts::read_one)
                .patch(accounts::update)
                .delete(accounts::delete),
        )
        .route(
            &format!("{}/:id/refresh", ACCOUNTS_URI),
            post(accounts::refresh),
        )
}

async fn health_handler() -> &'static str {
    "UP"
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details: Vec<String> = Vec::new();

        let (status, message) = match self {
            ApiError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ApiError::Store(StoreError::Conflict(_)) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Store(StoreError::InvalidAccount(_)) | ApiError::Reconcile(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            ApiError::Store(e) => {
                if App::json_output() {
                    tracing::error!("{}", ReportRenderer(ReportType::Json, &e));
                } else {
                    tracing::error!("{}", ReportRenderer(ReportType::Graphical, &e));
                }

                let mut messages: Vec<String> =
                    format!("{}", ReportRenderer(ReportType::Narratable, &e))
                        .split('\n')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect();

                let message = if messages.is_empty() {
                    e.to_string()
                } else {
                    messages.remove(0)
                };
                details.extend(messages);

                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };

        let body = if details.is_empty() {
            Json(json!({
                "result": "failure",
                "message": message
            }))
        } else {
            Json(json!({
                "result": "failure",
                "message": message,
                "details": details
            }))
        };

        (status, body).into_response()
    }
}
