//! Domain row models for the ledger, saga, and catalog.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, AssetId, FilterId, ModelId, ReservationId};

/// A credit account.
///
/// `balance` is the total of credits ever purchased minus ever spent;
/// `held` is the amount currently reserved by in-flight generations.
/// The spendable amount is always `balance - held`, and the store keeps
/// `0 <= held <= balance` at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
    pub held: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Spendable credits: total balance minus the held amount.
    pub fn available(&self) -> Decimal {
        self.balance - self.held
    }
}

/// Lifecycle of a funds reservation.
///
/// `Processing` is the only mutable state; a reservation transitions to
/// `Completed` (charged) or `Failed` (refunded) exactly once and the
/// terminal row is retained indefinitely as the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Processing,
    Completed,
    Failed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Processing => "processing",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ReservationStatus::Processing),
            "completed" => Ok(ReservationStatus::Completed),
            "failed" => Ok(ReservationStatus::Failed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A hold of credits for one generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a requested output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Waiting for the generation stage (or for a provider webhook).
    Pending,
    /// Inline provider output is being persisted to durable storage.
    Uploading,
    /// The output exists; `output_location` points at it. During
    /// materialization of a URL-flavored result this may briefly be the
    /// provider's ephemeral URL before the permanent one replaces it.
    Generated,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Uploading => "uploading",
            AssetStatus::Generated => "generated",
            AssetStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssetStatus::Pending),
            "uploading" => Ok(AssetStatus::Uploading),
            "generated" => Ok(AssetStatus::Generated),
            "failed" => Ok(AssetStatus::Failed),
            other => Err(format!("unknown asset status: {other}")),
        }
    }
}

/// One requested output image. Rows are never deleted; the set of
/// `Generated` assets is the user's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub account_id: AccountId,
    pub reservation_id: ReservationId,
    /// Provider-issued request identifier; set once the provider accepts
    /// the job, used by the webhook reconciler for correlation.
    pub provider_request_id: Option<String>,
    pub status: AssetStatus,
    pub output_location: Option<String>,
    /// Authoritative retry counter for the generation stage.
    pub attempt: i32,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A generatable model in the catalog, priced per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageModel {
    pub id: ModelId,
    pub name: String,
    /// Provider adapter key, e.g. "openai".
    pub provider: String,
    /// Provider-side model key, e.g. "gpt-image-1".
    pub model: String,
    pub cost_per_call: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A styled preset on top of a model, optionally adding to the price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Filter {
    pub id: FilterId,
    pub model_id: ModelId,
    pub name: String,
    pub additional_cost: Decimal,
    pub created_at: DateTime<Utc>,
}

/// What `record_generation_failure` decided, in the same atomic unit that
/// incremented the attempt counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Attempts remain; the queue should redeliver. The reservation was not
    /// touched - the user has not been charged and must not be refunded for
    /// an in-progress retry.
    Retry { attempt: i32 },
    /// Attempts exhausted (or the failure was permanent): the reservation
    /// was cancelled, the hold released, and the asset marked failed.
    Refunded,
}

/// Per-asset result carried by a provider webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Provider hosts the output at an ephemeral URL; show it immediately
    /// and materialize in the background.
    Url(String),
    /// Provider returned the image inline (base64); must be persisted
    /// before it can be shown.
    Inline(String),
}
