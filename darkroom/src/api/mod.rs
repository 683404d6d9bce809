//! HTTP surface.
//!
//! A thin axum layer over the reservation manager, the store, and the
//! webhook reconciler. Authentication and session issuance live outside
//! this service; handlers take explicit account ids.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;
pub mod models;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/accounts", post(handlers::accounts::create_account))
        .route(
            "/api/v1/accounts/{account_id}/balance",
            get(handlers::accounts::get_balance),
        )
        .route(
            "/api/v1/accounts/{account_id}/credits",
            post(handlers::accounts::grant_credits),
        )
        .route(
            "/api/v1/accounts/{account_id}/assets",
            get(handlers::accounts::list_generated_assets),
        )
        .route(
            "/api/v1/generations",
            post(handlers::generations::request_generation),
        )
        .route(
            "/api/v1/generations/{reservation_id}",
            get(handlers::generations::get_generation_status),
        )
        .route(
            "/api/v1/assets/{asset_id}",
            get(handlers::generations::get_asset),
        )
        .route(
            "/api/v1/webhooks/{provider}",
            post(handlers::webhooks::provider_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
