//! Request/response shapes for the HTTP API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::{Asset, AssetStatus, ReservationStatus};
use crate::types::{AccountId, AssetId, FilterId, ModelId, ReservationId};

#[derive(Debug, Deserialize)]
pub struct AccountCreate {
    /// Starting balance; defaults to the configured signup grant.
    pub initial_balance: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub held: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct GrantCreate {
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct GenerationCreate {
    pub account_id: AccountId,
    pub model_id: ModelId,
    pub filter_id: Option<FilterId>,
    /// Number of images to generate; defaults to 1.
    pub count: Option<u32>,
    /// Provider-specific parameters, validated by the adapter.
    #[serde(default)]
    pub input: serde_json::Value,
}

/// 202 body: the "ticket" the client polls with.
#[derive(Debug, Serialize)]
pub struct GenerationAccepted {
    pub reservation_id: ReservationId,
    pub status: &'static str,
    pub asset_ids: Vec<AssetId>,
    pub status_url: String,
}

#[derive(Debug, Serialize)]
pub struct GenerationStatusResponse {
    pub reservation_id: ReservationId,
    pub reservation_status: ReservationStatus,
    /// COMPLETED once every asset is generated, FAILED if any failed
    /// terminally, PENDING otherwise.
    pub status: &'static str,
    pub num_assets: usize,
    pub completed_assets: Vec<AssetResponse>,
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub id: AssetId,
    pub account_id: AccountId,
    pub reservation_id: ReservationId,
    pub status: AssetStatus,
    pub output_location: Option<String>,
    pub fail_reason: Option<String>,
}

impl From<Asset> for AssetResponse {
    fn from(asset: Asset) -> Self {
        Self {
            id: asset.id,
            account_id: asset.account_id,
            reservation_id: asset.reservation_id,
            status: asset.status,
            output_location: asset.output_location,
            fail_reason: asset.fail_reason,
        }
    }
}

/// fal-style webhook payload: request id, OK/ERROR status, and the image
/// descriptors (either a hosted URL or inline base64 per image).
#[derive(Debug, Deserialize)]
pub struct ProviderWebhookPayload {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub payload: Option<WebhookImages>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookImages {
    #[serde(default)]
    pub images: Vec<WebhookImage>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub b64_json: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAckResponse {
    pub status: &'static str,
    pub assets: usize,
}
