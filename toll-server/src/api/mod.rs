use std::fmt;

use axum::{
    body::{boxed, Bytes},
    handler::Handler,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Extension, Router,
};
use hyper::{Body, Uri};
use miette::{Diagnostic, GraphicalReportHandler, JSONReportHandler, NarratableReportHandler};
use serde_json::json;
use toll_core::Reconciler;

mod json;
pub mod v1;

pub use json::Json;

use crate::store::AccountStore;

pub fn build(store: AccountStore, reconciler: Reconciler) -> Router {
    Router::new()
        .merge(v1::router())
        .layer(Extension(store))
        .layer(Extension(reconciler))
        .layer(middleware::from_fn(error_middleware))
        .fallback(not_found_handler.into_service())
}

/// How a [`Diagnostic`] is rendered by [`ReportRenderer`].
pub enum ReportType {
    Json,
    Graphical,
    Narratable,
}

/// Renders a [`Diagnostic`] report through [`fmt::Display`].
pub struct ReportRenderer<'a>(pub ReportType, pub &'a dyn Diagnostic);

impl fmt::Display for ReportRenderer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ReportType::Json => JSONReportHandler::new().render_report(f, self.1),
            ReportType::Graphical => GraphicalReportHandler::new().render_report(f, self.1),
            ReportType::Narratable => NarratableReportHandler::new().render_report(f, self.1),
        }
    }
}

async fn not_found_handler(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "result": "failure",
            "message": "not found",
            "uri": uri.to_string()
        })),
    )
}

/// Wraps plain-text client error bodies, such as extractor rejections, in the
/// JSON failure envelope.
async fn error_middleware<B>(req: Request<B>, next: Next<B>) -> Response {
    let response = next.run(req).await;
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("application/json"));
    if !response.status().is_client_error() || is_json {
        return response;
    }

    let (mut head, body) = response.into_parts();
    let message = match hyper::body::to_bytes(body).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(e) => {
            tracing::error!("failed to read error response body: {}", e);
            String::new()
        }
    };

    let json_body = json!({
        "result": "failure",
        "message": message,
    })
    .to_string();

    head.headers.remove(hyper::header::CONTENT_LENGTH);
    head.headers.insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );

    Response::from_parts(head, boxed(Body::from(Bytes::from(json_body))))
}
