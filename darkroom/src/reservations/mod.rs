//! The reservation saga coordinator.
//!
//! Accepting a generation request is the only place funds get held:
//! validate the input (free), price the batch from the catalog, hold the
//! funds and create the placeholder assets atomically, then queue one
//! generation job per asset. The user is told "accepted" the moment the
//! hold exists; the actual charge happens when an external, slow, fallible
//! computation has verifiably finished (commit), or never (cancel).

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::errors::{Error, Result};
use crate::jobs::{GENERATION_QUEUE, GenerationJob};
use crate::providers::{GenerateInput, ProviderRegistry};
use crate::store::{Asset, Reservation, Store};
use crate::types::{AccountId, FilterId, ModelId};

/// A priced, validated request to generate `count` assets.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub account_id: AccountId,
    pub model_id: ModelId,
    pub filter_id: Option<FilterId>,
    pub count: u32,
    pub input: GenerateInput,
}

pub struct ReservationManager<Q: carousel::Storage> {
    store: Arc<dyn Store>,
    registry: ProviderRegistry,
    queue: Arc<Q>,
    max_assets_per_request: u32,
}

impl<Q: carousel::Storage> ReservationManager<Q> {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ProviderRegistry,
        queue: Arc<Q>,
        max_assets_per_request: u32,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            max_assets_per_request,
        }
    }

    /// Price a request from the catalog:
    /// `cost_per_call x count + filter.additional_cost`.
    pub async fn quote(
        &self,
        model_id: ModelId,
        filter_id: Option<FilterId>,
        count: u32,
    ) -> Result<Decimal> {
        let model = self.store.get_model(model_id).await?;
        let mut cost = model.cost_per_call * Decimal::from(count);

        if let Some(filter_id) = filter_id {
            let filter = self.store.get_filter(filter_id).await?;
            if filter.model_id != model.id {
                return Err(Error::BadRequest {
                    message: "Filter does not belong to the requested model".to_string(),
                });
            }
            cost += filter.additional_cost;
        }

        Ok(cost)
    }

    /// Accept-or-reject a generation request.
    ///
    /// On success the funds are held, the placeholder assets exist, and one
    /// generation job per asset is queued. On any failure nothing is held:
    /// validation and pricing run before the reserve, and a queue failure
    /// after it triggers the compensating cancel.
    #[tracing::instrument(skip(self, request), fields(account_id = %request.account_id, model_id = %request.model_id))]
    pub async fn reserve_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<(Reservation, Vec<Asset>)> {
        if request.count == 0 || request.count > self.max_assets_per_request {
            return Err(Error::BadRequest {
                message: format!(
                    "count must be between 1 and {}",
                    self.max_assets_per_request
                ),
            });
        }

        let model = self.store.get_model(request.model_id).await?;
        let adapter = self
            .registry
            .resolve(&model.provider, &model.model)
            .ok_or_else(|| Error::ProviderNotFound {
                provider: model.provider.clone(),
                model: model.model.clone(),
            })?;

        // Validate before any funds move or anything is queued; the user
        // gets immediate feedback and nothing needs compensating.
        let validation = adapter.validate(&request.input);
        if !validation.ok {
            return Err(Error::InvalidInput {
                message: validation.message,
            });
        }

        let cost = self
            .quote(request.model_id, request.filter_id, request.count)
            .await?;

        let (reservation, assets) = self
            .store
            .reserve(request.account_id, cost, request.count)
            .await
            .map_err(Error::from)?;

        tracing::info!(
            reservation_id = %reservation.id,
            cost = %cost,
            assets = assets.len(),
            "Held funds and created placeholder assets"
        );

        for asset in &assets {
            let job = GenerationJob {
                asset_id: asset.id,
                reservation_id: reservation.id,
                provider: model.provider.clone(),
                model: model.model.clone(),
                input: request.input.clone(),
            };
            let payload = serde_json::to_value(&job).map_err(anyhow::Error::from)?;

            if let Err(e) = carousel::submit(self.queue.as_ref(), GENERATION_QUEUE, payload).await {
                // The request-path contract is accepted-or-untouched:
                // release the hold and fail the whole batch.
                tracing::error!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "Failed to queue generation job, cancelling reservation"
                );
                self.store.cancel_reservation(reservation.id).await?;
                for asset in &assets {
                    self.store
                        .mark_asset_failed(asset.id, "Failed to queue generation job")
                        .await?;
                }
                return Err(Error::Other(anyhow::anyhow!(
                    "Failed to queue generation job: {e}"
                )));
            }
        }

        Ok((reservation, assets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::dummy::DummyProvider;
    use crate::store::{AssetStatus, InMemoryStore, ReservationStatus, StoreError};
    use carousel::{InMemoryStorage, Storage};
    use rust_decimal::prelude::FromPrimitive;

    fn dec(n: i64) -> Decimal {
        Decimal::from_i64(n).expect("valid decimal")
    }

    async fn setup() -> (
        Arc<InMemoryStore>,
        Arc<InMemoryStorage>,
        ReservationManager<InMemoryStorage>,
        ModelId,
    ) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryStorage::new());
        let model = store
            .create_model("Checkerboard", "dummy", "checkerboard", dec(2))
            .await
            .unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register("dummy", "checkerboard", Arc::new(DummyProvider::new()));

        let manager = ReservationManager::new(
            store.clone() as Arc<dyn Store>,
            registry,
            queue.clone(),
            8,
        );
        (store, queue, manager, model.id)
    }

    #[tokio::test]
    async fn reserve_generation_holds_funds_and_queues_jobs() {
        let (store, queue, manager, model_id) = setup().await;
        let account = store.create_account(dec(100)).await.unwrap();

        let (reservation, assets) = manager
            .reserve_generation(GenerationRequest {
                account_id: account.id,
                model_id,
                filter_id: None,
                count: 2,
                input: serde_json::json!({}),
            })
            .await
            .unwrap();

        assert_eq!(reservation.status, ReservationStatus::Processing);
        assert_eq!(reservation.amount, dec(4));
        assert_eq!(assets.len(), 2);
        assert!(assets.iter().all(|a| a.status == AssetStatus::Pending));

        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.balance, dec(100));
        assert_eq!(account.held, dec(4));

        let pending = queue.view_pending(GENERATION_QUEUE, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn filter_cost_is_added_once() {
        let (store, _, manager, model_id) = setup().await;
        let filter = store.create_filter(model_id, "Ghibli", dec(3)).await.unwrap();

        let cost = manager.quote(model_id, Some(filter.id), 2).await.unwrap();
        assert_eq!(cost, dec(7)); // 2 x 2 + 3
    }

    #[tokio::test]
    async fn filter_for_other_model_is_rejected() {
        let (store, _, manager, model_id) = setup().await;
        let other_model = store
            .create_model("Other", "dummy", "other", dec(1))
            .await
            .unwrap();
        let filter = store
            .create_filter(other_model.id, "Ghibli", dec(3))
            .await
            .unwrap();

        let err = manager.quote(model_id, Some(filter.id), 1).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn insufficient_funds_touches_nothing() {
        let (store, queue, manager, model_id) = setup().await;
        let account = store.create_account(dec(1)).await.unwrap();

        let err = manager
            .reserve_generation(GenerationRequest {
                account_id: account.id,
                model_id,
                filter_id: None,
                count: 1,
                input: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::InsufficientFunds { .. })
        ));

        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.held, dec(0));
        assert!(
            queue
                .view_pending(GENERATION_QUEUE, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_funds() {
        let (store, _, manager, model_id) = setup().await;
        let account = store.create_account(dec(100)).await.unwrap();

        // The dummy adapter requires a JSON object
        let err = manager
            .reserve_generation(GenerationRequest {
                account_id: account.id,
                model_id,
                filter_id: None,
                count: 1,
                input: serde_json::json!("not an object"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));

        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.held, dec(0));
    }

    #[tokio::test]
    async fn concurrent_reserves_admit_exactly_one() {
        let (store, _, manager, model_id) = setup().await;
        // available exactly covers one 2-credit generation
        let account = store.create_account(dec(2)).await.unwrap();
        let manager = Arc::new(manager);

        let request = GenerationRequest {
            account_id: account.id,
            model_id,
            filter_id: None,
            count: 1,
            input: serde_json::json!({}),
        };

        let first = tokio::spawn({
            let manager = manager.clone();
            let request = request.clone();
            async move { manager.reserve_generation(request).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            let request = request.clone();
            async move { manager.reserve_generation(request).await }
        });

        let results = [first.await.unwrap(), second.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let shortfalls = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(Error::Store(StoreError::InsufficientFunds { .. }))
                )
            })
            .count();

        assert_eq!(successes, 1);
        assert_eq!(shortfalls, 1);

        let account = store.get_account(account.id).await.unwrap();
        assert_eq!(account.held, dec(2));
        assert_eq!(account.available(), dec(0));
    }
}
