//! Inbound provider webhook reconciliation.
//!
//! Webhook-flavored providers accept a job and later push the results to
//! us, keyed by their request id. Delivery is at-least-once and the payload
//! carries the whole batch, so the reconciler is written around three
//! rules: correlate strictly (output count must match the pending asset
//! count, one shared reservation per batch), apply atomically (the store
//! method commits the reservation and moves every row in one unit), and
//! treat replays as successful no-ops.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::jobs::{MATERIALIZATION_QUEUE, MaterializationJob, MaterializationSource};
use crate::store::{Store, WebhookDisposition};
use crate::types::abbrev_uuid;

/// A provider's asynchronous result notification, already parsed out of
/// the provider-specific wire format by the HTTP layer.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub provider_request_id: String,
    pub result: WebhookResult,
}

#[derive(Debug, Clone)]
pub enum WebhookResult {
    /// One output per requested asset, in order.
    Success(Vec<WebhookOutput>),
    /// The provider failed the whole batch.
    Failure { reason: String },
}

#[derive(Debug, Clone)]
pub enum WebhookOutput {
    Url(String),
    Inline(String),
}

/// How a webhook delivery was settled; returned to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    /// Results applied: reservation committed, assets moved onward.
    Applied { assets: usize },
    /// Batch failure applied: reservation cancelled, assets failed.
    FailureRecorded { assets: usize },
    /// Nothing pending for this request id - an already-processed
    /// delivery. Success, no side effects.
    Replay,
}

pub struct Reconciler<Q: carousel::Storage> {
    store: Arc<dyn Store>,
    queue: Arc<Q>,
}

impl<Q: carousel::Storage> Reconciler<Q> {
    pub fn new(store: Arc<dyn Store>, queue: Arc<Q>) -> Self {
        Self { store, queue }
    }

    /// Apply one webhook delivery.
    #[tracing::instrument(skip(self, notification), fields(provider_request_id = %notification.provider_request_id))]
    pub async fn apply(&self, notification: WebhookNotification) -> Result<WebhookAck> {
        let pending = self
            .store
            .pending_assets_for_provider_request(&notification.provider_request_id)
            .await?;

        if pending.is_empty() {
            tracing::info!("No pending assets for webhook; treating as replay");
            return Ok(WebhookAck::Replay);
        }

        // One reservation per batch; a mix means correlation is corrupted
        // and nothing can be applied safely.
        let reservation_id = pending[0].reservation_id;
        if pending.iter().any(|a| a.reservation_id != reservation_id) {
            return Err(Error::Other(anyhow::anyhow!(
                "Assets for provider request {} span multiple reservations",
                notification.provider_request_id
            )));
        }

        match notification.result {
            WebhookResult::Failure { reason } => {
                let asset_ids: Vec<_> = pending.iter().map(|a| a.id).collect();
                let count = asset_ids.len();
                self.store
                    .fail_webhook_batch(reservation_id, asset_ids, &reason)
                    .await?;
                tracing::warn!(
                    reservation = %abbrev_uuid(&reservation_id),
                    assets = count,
                    reason = %reason,
                    "Provider reported batch failure; hold released"
                );
                Ok(WebhookAck::FailureRecorded { assets: count })
            }
            WebhookResult::Success(outputs) => {
                // Per-row correlation would be ambiguous on a mismatch, so
                // reject the whole delivery and apply nothing.
                if outputs.len() != pending.len() {
                    return Err(Error::WebhookCountMismatch {
                        outputs: outputs.len(),
                        pending: pending.len(),
                    });
                }

                let rows: Vec<(crate::types::AssetId, WebhookDisposition)> = pending
                    .iter()
                    .zip(outputs)
                    .map(|(asset, output)| {
                        let disposition = match output {
                            WebhookOutput::Url(url) => WebhookDisposition::Url(url),
                            WebhookOutput::Inline(b64) => WebhookDisposition::Inline(b64),
                        };
                        (asset.id, disposition)
                    })
                    .collect();

                let count = rows.len();
                self.store
                    .complete_webhook_batch(reservation_id, rows.clone())
                    .await?;
                tracing::info!(
                    reservation = %abbrev_uuid(&reservation_id),
                    assets = count,
                    "Webhook applied; reservation committed"
                );

                // The batch is committed and every row moved; queue the
                // persistence work. A queue failure here is the same
                // recorded inconsistency as the generation worker's
                // handoff failure - never a refund.
                for (asset_id, disposition) in rows {
                    let source = match disposition {
                        WebhookDisposition::Url(url) => MaterializationSource::Url { url },
                        WebhookDisposition::Inline(b64) => MaterializationSource::Inline { b64 },
                    };
                    let job = MaterializationJob { asset_id, source };
                    let payload = serde_json::to_value(&job).map_err(anyhow::Error::from)?;
                    if let Err(e) =
                        carousel::submit(self.queue.as_ref(), MATERIALIZATION_QUEUE, payload).await
                    {
                        tracing::error!(
                            asset = %abbrev_uuid(&asset_id),
                            error = %e,
                            "Failed to queue materialization for webhook output"
                        );
                        self.store
                            .mark_asset_failed(asset_id, "Failed to queue for materialization")
                            .await?;
                    }
                }

                Ok(WebhookAck::Applied { assets: count })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AssetStatus, InMemoryStore, ReservationStatus};
    use carousel::{InMemoryStorage, Storage};
    use rust_decimal::Decimal;

    const REQUEST_ID: &str = "fal-req-1";

    async fn setup(asset_count: u32) -> (Arc<InMemoryStore>, Arc<InMemoryStorage>, Reconciler<InMemoryStorage>, crate::store::Reservation) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryStorage::new());
        let account = store.create_account(Decimal::from(100)).await.unwrap();
        let (reservation, assets) = store
            .reserve(account.id, Decimal::from(2), asset_count)
            .await
            .unwrap();
        for asset in &assets {
            store.set_asset_submitted(asset.id, REQUEST_ID).await.unwrap();
        }
        let reconciler = Reconciler::new(store.clone() as Arc<dyn Store>, queue.clone());
        (store, queue, reconciler, reservation)
    }

    fn success(outputs: Vec<WebhookOutput>) -> WebhookNotification {
        WebhookNotification {
            provider_request_id: REQUEST_ID.to_string(),
            result: WebhookResult::Success(outputs),
        }
    }

    #[tokio::test]
    async fn success_commits_and_queues_materialization() {
        let (store, queue, reconciler, reservation) = setup(2).await;

        let ack = reconciler
            .apply(success(vec![
                WebhookOutput::Url("https://cdn.fal.ai/a.png".to_string()),
                WebhookOutput::Url("https://cdn.fal.ai/b.png".to_string()),
            ]))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Applied { assets: 2 });

        let reservation = store.get_reservation(reservation.id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Completed);

        let account = store.get_account(reservation.account_id).await.unwrap();
        assert_eq!(account.balance, Decimal::from(98));
        assert_eq!(account.held, Decimal::ZERO);

        let assets = store.list_reservation_assets(reservation.id).await.unwrap();
        assert!(assets.iter().all(|a| a.status == AssetStatus::Generated));

        let queued = queue
            .view_pending(MATERIALIZATION_QUEUE, 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn replay_is_a_no_op() {
        let (store, queue, reconciler, reservation) = setup(1).await;

        reconciler
            .apply(success(vec![WebhookOutput::Url(
                "https://cdn.fal.ai/a.png".to_string(),
            )]))
            .await
            .unwrap();

        let balance_after_first = store
            .get_account(reservation.account_id)
            .await
            .unwrap()
            .balance;
        let queued_after_first = queue
            .view_pending(MATERIALIZATION_QUEUE, 10)
            .await
            .unwrap()
            .len();

        // Second delivery of the same webhook
        let ack = reconciler
            .apply(success(vec![WebhookOutput::Url(
                "https://cdn.fal.ai/a.png".to_string(),
            )]))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Replay);

        let account = store.get_account(reservation.account_id).await.unwrap();
        assert_eq!(account.balance, balance_after_first);
        assert_eq!(
            queue
                .view_pending(MATERIALIZATION_QUEUE, 10)
                .await
                .unwrap()
                .len(),
            queued_after_first,
            "replay must not enqueue more work"
        );
    }

    #[tokio::test]
    async fn count_mismatch_is_rejected_without_side_effects() {
        let (store, queue, reconciler, reservation) = setup(2).await;

        let err = reconciler
            .apply(success(vec![WebhookOutput::Url(
                "https://cdn.fal.ai/only-one.png".to_string(),
            )]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::WebhookCountMismatch {
                outputs: 1,
                pending: 2
            }
        ));

        // Nothing moved
        let reservation = store.get_reservation(reservation.id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Processing);
        let assets = store.list_reservation_assets(reservation.id).await.unwrap();
        assert!(assets.iter().all(|a| a.status == AssetStatus::Pending));
        assert!(
            queue
                .view_pending(MATERIALIZATION_QUEUE, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn provider_failure_refunds_once() {
        let (store, _, reconciler, reservation) = setup(2).await;

        let failure = WebhookNotification {
            provider_request_id: REQUEST_ID.to_string(),
            result: WebhookResult::Failure {
                reason: "safety checker rejected the prompt".to_string(),
            },
        };

        let ack = reconciler.apply(failure.clone()).await.unwrap();
        assert_eq!(ack, WebhookAck::FailureRecorded { assets: 2 });

        let account = store.get_account(reservation.account_id).await.unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(account.held, Decimal::ZERO);

        let assets = store.list_reservation_assets(reservation.id).await.unwrap();
        assert!(assets.iter().all(|a| a.status == AssetStatus::Failed));
        assert!(
            assets
                .iter()
                .all(|a| a.fail_reason.as_deref() == Some("safety checker rejected the prompt"))
        );

        // Replayed failure: no pending rows remain, so it's a no-op
        let ack = reconciler.apply(failure).await.unwrap();
        assert_eq!(ack, WebhookAck::Replay);
        let account = store.get_account(reservation.account_id).await.unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(account.held, Decimal::ZERO);
    }

    #[tokio::test]
    async fn inline_outputs_go_through_uploading() {
        let (store, queue, reconciler, reservation) = setup(1).await;

        let ack = reconciler
            .apply(success(vec![WebhookOutput::Inline("aGVsbG8=".to_string())]))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Applied { assets: 1 });

        let assets = store.list_reservation_assets(reservation.id).await.unwrap();
        assert_eq!(assets[0].status, AssetStatus::Uploading);

        let queued = queue
            .view_pending(MATERIALIZATION_QUEUE, 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].data.payload["source"]["kind"], "inline");
    }
}
