use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use crate::AppState;
use crate::api::models::{AccountCreate, AssetResponse, BalanceResponse, GrantCreate};
use crate::errors::Result;
use crate::store::Store;
use crate::types::AccountId;

// POST /api/v1/accounts - create an account with the signup grant
pub async fn create_account(
    State(state): State<AppState>,
    Json(body): Json<AccountCreate>,
) -> Result<(StatusCode, Json<BalanceResponse>)> {
    let initial = body
        .initial_balance
        .unwrap_or(state.config.initial_account_balance);
    let account = state.store.create_account(initial).await?;

    Ok((
        StatusCode::CREATED,
        Json(BalanceResponse {
            account_id: account.id,
            balance: account.balance,
            held: account.held,
            available: account.available(),
        }),
    ))
}

// GET /api/v1/accounts/{account_id}/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<BalanceResponse>> {
    let account = state.store.get_account(account_id).await?;
    Ok(Json(BalanceResponse {
        account_id: account.id,
        balance: account.balance,
        held: account.held,
        available: account.available(),
    }))
}

// POST /api/v1/accounts/{account_id}/credits - purchase grant
pub async fn grant_credits(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    Json(body): Json<GrantCreate>,
) -> Result<Json<BalanceResponse>> {
    if body.amount <= rust_decimal::Decimal::ZERO {
        return Err(crate::errors::Error::BadRequest {
            message: "amount must be positive".to_string(),
        });
    }

    let account = state.store.grant(account_id, body.amount).await?;
    tracing::info!(
        account_id = %account_id,
        amount = %body.amount,
        "Granted credits"
    );

    Ok(Json(BalanceResponse {
        account_id: account.id,
        balance: account.balance,
        held: account.held,
        available: account.available(),
    }))
}

// GET /api/v1/accounts/{account_id}/assets - the gallery
pub async fn list_generated_assets(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<Vec<AssetResponse>>> {
    // 404 for unknown accounts rather than an empty gallery
    state.store.get_account(account_id).await?;

    let assets = state.store.list_generated_assets(account_id).await?;
    Ok(Json(assets.into_iter().map(AssetResponse::from).collect()))
}
