//! HTTP surface of the daemon.
//!
//! Only a health check and the Ko-fi donation webhook live here. Site management happens
//! through the CLI.
//!
//! - `GET /healthz`: liveness, always `OK`
//! - `POST /v1/webhooks/kofi`: form-encoded Ko-fi notification (`data` holds the JSON payload)

pub mod handlers;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/v1/webhooks/kofi", post(handlers::webhooks::kofi))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
