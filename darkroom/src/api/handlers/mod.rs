//! Axum route handlers.

pub mod accounts;
pub mod generations;
pub mod webhooks;

/// Liveness probe.
pub async fn health() -> &'static str {
    "OK"
}
