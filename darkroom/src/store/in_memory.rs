//! In-memory store implementation.
//!
//! Everything lives behind one mutex, so each trait method is naturally the
//! same atomic unit the Postgres backend gets from a transaction. Suitable
//! for tests and single-process development; state is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::{AccountId, AssetId, FilterId, ModelId, ReservationId};

use super::error::{Result, StoreError};
use super::models::*;
use super::Store;

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    reservations: HashMap<ReservationId, Reservation>,
    assets: HashMap<AssetId, Asset>,
    models: HashMap<ModelId, ImageModel>,
    filters: HashMap<FilterId, Filter>,
}

impl Inner {
    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account> {
        self.accounts.get_mut(&id).ok_or(StoreError::AccountNotFound)
    }

    fn asset_mut(&mut self, id: AssetId) -> Result<&mut Asset> {
        self.assets.get_mut(&id).ok_or(StoreError::AssetNotFound)
    }

    /// Release the hold and mark the reservation FAILED; the shared cancel
    /// path for refunds. Tolerates an already-FAILED reservation (duplicate
    /// delivery) by doing nothing; a COMPLETED one is a hard error.
    fn cancel_reservation_inner(&mut self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound)?;
        match reservation.status {
            ReservationStatus::Processing => {}
            actual => {
                return Err(StoreError::InvalidReservationState { id, actual });
            }
        }

        let account = self.account_mut(reservation.account_id)?;
        account.held -= reservation.amount;

        let reservation = self.reservations.get_mut(&id).expect("checked above");
        reservation.status = ReservationStatus::Failed;
        reservation.updated_at = Utc::now();
        Ok(reservation.clone())
    }
}

/// Single-process implementation of [`Store`].
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_account(&self, initial_balance: Decimal) -> Result<Account> {
        let account = Account {
            id: AccountId::new_v4(),
            balance: initial_balance,
            held: Decimal::ZERO,
            created_at: Utc::now(),
        };
        self.inner.lock().accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.inner
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(StoreError::AccountNotFound)
    }

    async fn available(&self, id: AccountId) -> Result<Decimal> {
        Ok(self.get_account(id).await?.available())
    }

    async fn grant(&self, id: AccountId, amount: Decimal) -> Result<Account> {
        let mut inner = self.inner.lock();
        let account = inner.account_mut(id)?;
        account.balance += amount;
        Ok(account.clone())
    }

    async fn reserve(
        &self,
        account_id: AccountId,
        amount: Decimal,
        asset_count: u32,
    ) -> Result<(Reservation, Vec<Asset>)> {
        let mut inner = self.inner.lock();
        let account = inner.account_mut(account_id)?;

        let available = account.available();
        if available < amount {
            return Err(StoreError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        account.held += amount;

        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new_v4(),
            account_id,
            amount,
            status: ReservationStatus::Processing,
            created_at: now,
            updated_at: now,
        };
        inner
            .reservations
            .insert(reservation.id, reservation.clone());

        let assets: Vec<Asset> = (0..asset_count)
            .map(|_| Asset {
                id: AssetId::new_v4(),
                account_id,
                reservation_id: reservation.id,
                provider_request_id: None,
                status: AssetStatus::Pending,
                output_location: None,
                attempt: 0,
                fail_reason: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        for asset in &assets {
            inner.assets.insert(asset.id, asset.clone());
        }

        Ok((reservation, assets))
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        let reservation = inner
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound)?;
        match reservation.status {
            ReservationStatus::Processing => {}
            actual => {
                return Err(StoreError::InvalidReservationState { id, actual });
            }
        }

        let account = inner.account_mut(reservation.account_id)?;
        account.balance -= reservation.amount;
        account.held -= reservation.amount;

        let reservation = inner.reservations.get_mut(&id).expect("checked above");
        reservation.status = ReservationStatus::Completed;
        reservation.updated_at = Utc::now();
        Ok(reservation.clone())
    }

    async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.inner.lock().cancel_reservation_inner(id)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.inner
            .lock()
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound)
    }

    async fn get_asset(&self, id: AssetId) -> Result<Asset> {
        self.inner
            .lock()
            .assets
            .get(&id)
            .cloned()
            .ok_or(StoreError::AssetNotFound)
    }

    async fn list_reservation_assets(&self, id: ReservationId) -> Result<Vec<Asset>> {
        let inner = self.inner.lock();
        let mut assets: Vec<Asset> = inner
            .assets
            .values()
            .filter(|a| a.reservation_id == id)
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.created_at);
        Ok(assets)
    }

    async fn list_generated_assets(&self, id: AccountId) -> Result<Vec<Asset>> {
        let inner = self.inner.lock();
        let mut assets: Vec<Asset> = inner
            .assets
            .values()
            .filter(|a| a.account_id == id && a.status == AssetStatus::Generated)
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.created_at);
        Ok(assets)
    }

    async fn set_asset_submitted(&self, id: AssetId, provider_request_id: &str) -> Result<Asset> {
        let mut inner = self.inner.lock();
        let asset = inner.asset_mut(id)?;
        asset.provider_request_id = Some(provider_request_id.to_string());
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    async fn mark_asset_uploading(
        &self,
        id: AssetId,
        provider_request_id: Option<&str>,
    ) -> Result<Asset> {
        let mut inner = self.inner.lock();
        let asset = inner.asset_mut(id)?;
        asset.status = AssetStatus::Uploading;
        if let Some(request_id) = provider_request_id {
            asset.provider_request_id = Some(request_id.to_string());
        }
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    async fn mark_asset_generated(&self, id: AssetId, output_location: &str) -> Result<Asset> {
        let mut inner = self.inner.lock();
        let asset = inner.asset_mut(id)?;
        asset.status = AssetStatus::Generated;
        asset.output_location = Some(output_location.to_string());
        asset.fail_reason = None;
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    async fn mark_asset_failed(&self, id: AssetId, reason: &str) -> Result<Asset> {
        let mut inner = self.inner.lock();
        let asset = inner.asset_mut(id)?;
        asset.status = AssetStatus::Failed;
        asset.fail_reason = Some(reason.to_string());
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    async fn record_generation_failure(
        &self,
        id: AssetId,
        reason: &str,
        max_attempts: i32,
        permanent: bool,
    ) -> Result<FailureDisposition> {
        let mut inner = self.inner.lock();

        let (attempt, reservation_id) = {
            let asset = inner.asset_mut(id)?;
            asset.attempt += 1;
            asset.updated_at = Utc::now();
            (asset.attempt, asset.reservation_id)
        };

        if !permanent && attempt < max_attempts {
            return Ok(FailureDisposition::Retry { attempt });
        }

        // Exhausted (or permanent): refund and close out the asset, all
        // under the same lock so duplicate deliveries cannot double-release.
        // A reservation already FAILED (duplicate delivery) or already
        // COMPLETED (a sibling asset in the batch committed it) leaves the
        // ledger alone; the asset still fails.
        match inner.cancel_reservation_inner(reservation_id) {
            Ok(_) => {}
            Err(StoreError::InvalidReservationState {
                actual: ReservationStatus::Failed | ReservationStatus::Completed,
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        let asset = inner.asset_mut(id)?;
        asset.status = AssetStatus::Failed;
        asset.fail_reason = Some(reason.to_string());
        asset.updated_at = Utc::now();

        Ok(FailureDisposition::Refunded)
    }

    async fn record_materialization_failure(&self, id: AssetId, reason: &str) -> Result<Asset> {
        let mut inner = self.inner.lock();
        let asset = inner.asset_mut(id)?;
        asset.attempt += 1;
        asset.status = AssetStatus::Failed;
        asset.fail_reason = Some(reason.to_string());
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    async fn pending_assets_for_provider_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<Asset>> {
        let inner = self.inner.lock();
        let mut assets: Vec<Asset> = inner
            .assets
            .values()
            .filter(|a| {
                a.provider_request_id.as_deref() == Some(provider_request_id)
                    && a.status == AssetStatus::Pending
            })
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.created_at);
        Ok(assets)
    }

    async fn complete_webhook_batch(
        &self,
        reservation_id: ReservationId,
        rows: Vec<(AssetId, WebhookDisposition)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        // Commit first: the PROCESSING guard makes a concurrent duplicate
        // delivery fail here before any asset row has moved.
        let reservation = inner
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound)?;
        match reservation.status {
            ReservationStatus::Processing => {
                let account = inner.account_mut(reservation.account_id)?;
                account.balance -= reservation.amount;
                account.held -= reservation.amount;
                let reservation = inner
                    .reservations
                    .get_mut(&reservation_id)
                    .expect("checked above");
                reservation.status = ReservationStatus::Completed;
                reservation.updated_at = Utc::now();
            }
            actual => {
                return Err(StoreError::InvalidReservationState {
                    id: reservation_id,
                    actual,
                });
            }
        }

        let now = Utc::now();
        for (asset_id, disposition) in rows {
            let asset = inner.asset_mut(asset_id)?;
            match disposition {
                WebhookDisposition::Url(url) => {
                    asset.status = AssetStatus::Generated;
                    asset.output_location = Some(url);
                }
                WebhookDisposition::Inline(_) => {
                    asset.status = AssetStatus::Uploading;
                }
            }
            asset.updated_at = now;
        }

        Ok(())
    }

    async fn fail_webhook_batch(
        &self,
        reservation_id: ReservationId,
        asset_ids: Vec<AssetId>,
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.cancel_reservation_inner(reservation_id) {
            Ok(_) => {}
            // Replayed failure webhook: hold already released
            Err(StoreError::InvalidReservationState {
                actual: ReservationStatus::Failed,
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        for asset_id in asset_ids {
            let asset = inner.asset_mut(asset_id)?;
            asset.status = AssetStatus::Failed;
            asset.fail_reason = Some(reason.to_string());
            asset.updated_at = now;
        }

        Ok(())
    }

    async fn get_model(&self, id: ModelId) -> Result<ImageModel> {
        self.inner
            .lock()
            .models
            .get(&id)
            .cloned()
            .ok_or(StoreError::ModelNotFound)
    }

    async fn get_filter(&self, id: FilterId) -> Result<Filter> {
        self.inner
            .lock()
            .filters
            .get(&id)
            .cloned()
            .ok_or(StoreError::FilterNotFound)
    }

    async fn create_model(
        &self,
        name: &str,
        provider: &str,
        model: &str,
        cost_per_call: Decimal,
    ) -> Result<ImageModel> {
        let row = ImageModel {
            id: ModelId::new_v4(),
            name: name.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            cost_per_call,
            created_at: Utc::now(),
        };
        self.inner.lock().models.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_filter(
        &self,
        model_id: ModelId,
        name: &str,
        additional_cost: Decimal,
    ) -> Result<Filter> {
        let row = Filter {
            id: FilterId::new_v4(),
            model_id,
            name: name.to_string(),
            additional_cost,
            created_at: Utc::now(),
        };
        self.inner.lock().filters.insert(row.id, row.clone());
        Ok(row)
    }
}
