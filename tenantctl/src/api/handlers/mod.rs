//! Axum route handlers.

pub mod webhooks;
