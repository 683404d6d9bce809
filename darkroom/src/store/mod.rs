//! Persistence for the ledger, reservation saga, assets, and catalog.
//!
//! The [`Store`] trait exposes *atomic units*, not bare row operations: every
//! method that touches the ledger carries its whole invariant inside the
//! call, so a backend either applies all of it or none of it. The Postgres
//! backend wraps each unit in a transaction; the in-memory backend (used by
//! the test suite and single-process development) serializes them on one
//! lock. This is what makes "held only changes inside a reservation
//! transition" and "refund exactly once" hold by construction rather than by
//! caller discipline.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{AccountId, AssetId, FilterId, ModelId, ReservationId};

pub mod error;
pub mod in_memory;
pub mod models;
pub mod postgres;

pub use error::{Result, StoreError};
pub use in_memory::InMemoryStore;
pub use models::*;
pub use postgres::PostgresStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Accounts / ledger
    // ------------------------------------------------------------------

    /// Create an account with a starting balance (signup grant or seed).
    async fn create_account(&self, initial_balance: Decimal) -> Result<Account>;

    async fn get_account(&self, id: AccountId) -> Result<Account>;

    /// Spendable credits: `balance - held`.
    async fn available(&self, id: AccountId) -> Result<Decimal>;

    /// Increment `balance` by `amount` (credit purchase).
    async fn grant(&self, id: AccountId, amount: Decimal) -> Result<Account>;

    // ------------------------------------------------------------------
    // Reservation saga
    // ------------------------------------------------------------------

    /// Reserve `amount` against an account and create the placeholder
    /// assets for the batch, as one atomic unit: verifies
    /// `available >= amount`, increments `held`, inserts the PROCESSING
    /// reservation and `asset_count` PENDING asset rows. Everything rolls
    /// back together; [`StoreError::InsufficientFunds`] has no side effects.
    async fn reserve(
        &self,
        account_id: AccountId,
        amount: Decimal,
        asset_count: u32,
    ) -> Result<(Reservation, Vec<Asset>)>;

    /// Convert the hold into a charge: debit `balance` and release `held`
    /// by the reserved amount, set status COMPLETED. Fails with
    /// [`StoreError::InvalidReservationState`] - and leaves the ledger
    /// untouched - unless the reservation is PROCESSING, so a duplicate
    /// commit can never double-charge.
    async fn commit_reservation(&self, id: ReservationId) -> Result<Reservation>;

    /// Reverse the hold without charging: release `held` by the reserved
    /// amount, set status FAILED. Same single-transition guard as commit.
    async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation>;

    async fn get_reservation(&self, id: ReservationId) -> Result<Reservation>;

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    async fn get_asset(&self, id: AssetId) -> Result<Asset>;

    async fn list_reservation_assets(&self, id: ReservationId) -> Result<Vec<Asset>>;

    /// The gallery: an account's GENERATED assets.
    async fn list_generated_assets(&self, id: AccountId) -> Result<Vec<Asset>>;

    /// Record the provider-issued request id on an asset that will be
    /// completed by a webhook; the asset stays PENDING.
    async fn set_asset_submitted(&self, id: AssetId, provider_request_id: &str) -> Result<Asset>;

    /// Inline output received: mark UPLOADING while materialization runs.
    async fn mark_asset_uploading(
        &self,
        id: AssetId,
        provider_request_id: Option<&str>,
    ) -> Result<Asset>;

    /// Output is visible at `output_location`: mark GENERATED. Used both
    /// for the provisional provider URL and for the final blob URL.
    async fn mark_asset_generated(&self, id: AssetId, output_location: &str) -> Result<Asset>;

    /// Terminal failure that must NOT touch the reservation (e.g. the
    /// post-commit handoff to materialization failed: the provider has been
    /// paid, so this is a recorded inconsistency, not a refund).
    async fn mark_asset_failed(&self, id: AssetId, reason: &str) -> Result<Asset>;

    /// Record a generation-stage failure and decide its consequence in the
    /// same atomic unit: increments the asset-row attempt counter (the
    /// authoritative one) and, when attempts reach `max_attempts` or
    /// `permanent` is set, cancels the reservation (single refund) and
    /// marks the asset FAILED with `reason`. If the batch's reservation
    /// was already settled - cancelled by a duplicate delivery, or
    /// committed by a sibling asset's success - the asset still fails but
    /// the ledger is left alone.
    async fn record_generation_failure(
        &self,
        id: AssetId,
        reason: &str,
        max_attempts: i32,
        permanent: bool,
    ) -> Result<FailureDisposition>;

    /// Record a materialization-stage failure: attempt counter and FAILED
    /// status with `reason`. Never touches the reservation - the funds were
    /// committed when generation succeeded. A later successful redelivery
    /// flips the asset back to GENERATED.
    async fn record_materialization_failure(&self, id: AssetId, reason: &str) -> Result<Asset>;

    // ------------------------------------------------------------------
    // Webhook reconciliation
    // ------------------------------------------------------------------

    /// Assets correlated to a provider request that are still PENDING, i.e.
    /// still waiting for their result. An empty result means the webhook is
    /// a replay (the first delivery already moved every row onward) and
    /// must be treated as a no-op.
    async fn pending_assets_for_provider_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<Asset>>;

    /// Apply a successful webhook batch atomically: commit the shared
    /// reservation (PROCESSING guard applies) and update every asset row -
    /// `Url` outputs become GENERATED at the provisional URL, `Inline`
    /// outputs become UPLOADING. Partial application is impossible; a crash
    /// replays the whole webhook against an unchanged state.
    async fn complete_webhook_batch(
        &self,
        reservation_id: ReservationId,
        rows: Vec<(AssetId, WebhookDisposition)>,
    ) -> Result<()>;

    /// Apply a provider-reported batch failure atomically: cancel the
    /// shared reservation (single refund) and mark every listed asset
    /// FAILED with `reason`.
    async fn fail_webhook_batch(
        &self,
        reservation_id: ReservationId,
        asset_ids: Vec<AssetId>,
        reason: &str,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    async fn get_model(&self, id: ModelId) -> Result<ImageModel>;

    async fn get_filter(&self, id: FilterId) -> Result<Filter>;

    async fn create_model(
        &self,
        name: &str,
        provider: &str,
        model: &str,
        cost_per_call: Decimal,
    ) -> Result<ImageModel>;

    async fn create_filter(
        &self,
        model_id: ModelId,
        name: &str,
        additional_cost: Decimal,
    ) -> Result<Filter>;
}
