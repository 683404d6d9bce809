use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use crate::AppState;
use crate::api::models::{
    AssetResponse, GenerationAccepted, GenerationCreate, GenerationStatusResponse,
};
use crate::errors::Result;
use crate::reservations::GenerationRequest;
use crate::store::{AssetStatus, ReservationStatus, Store};
use crate::types::{AssetId, ReservationId};

// POST /api/v1/generations - accept-or-reject a generation request.
//
// 202 means the funds are held and the jobs are queued; the client polls
// the status URL. Any error means nothing was touched.
pub async fn request_generation(
    State(state): State<AppState>,
    Json(body): Json<GenerationCreate>,
) -> Result<(StatusCode, Json<GenerationAccepted>)> {
    let (reservation, assets) = state
        .manager
        .reserve_generation(GenerationRequest {
            account_id: body.account_id,
            model_id: body.model_id,
            filter_id: body.filter_id,
            count: body.count.unwrap_or(1),
            input: body.input,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerationAccepted {
            reservation_id: reservation.id,
            status: "processing",
            asset_ids: assets.iter().map(|a| a.id).collect(),
            status_url: format!("/api/v1/generations/{}", reservation.id),
        }),
    ))
}

// GET /api/v1/generations/{reservation_id} - aggregate status of a batch
pub async fn get_generation_status(
    State(state): State<AppState>,
    Path(reservation_id): Path<ReservationId>,
) -> Result<Json<GenerationStatusResponse>> {
    let reservation = state.store.get_reservation(reservation_id).await?;
    let assets = state.store.list_reservation_assets(reservation_id).await?;

    let generated: Vec<AssetResponse> = assets
        .iter()
        .filter(|a| a.status == AssetStatus::Generated)
        .cloned()
        .map(AssetResponse::from)
        .collect();

    let status = if reservation.status == ReservationStatus::Failed {
        "failed"
    } else if generated.len() == assets.len() {
        "completed"
    } else {
        "pending"
    };

    Ok(Json(GenerationStatusResponse {
        reservation_id,
        reservation_status: reservation.status,
        status,
        num_assets: assets.len(),
        completed_assets: generated,
    }))
}

// GET /api/v1/assets/{asset_id}
pub async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<AssetId>,
) -> Result<Json<AssetResponse>> {
    let asset = state.store.get_asset(asset_id).await?;
    Ok(Json(AssetResponse::from(asset)))
}
