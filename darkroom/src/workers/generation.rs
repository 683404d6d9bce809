//! Generation stage worker.
//!
//! Pulls a job, invokes the matched provider adapter, and settles the
//! money: a confirmed success commits the hold and hands the output to the
//! materialization queue; a failure either lets the queue redeliver (funds
//! still held, user not charged) or - once the attempt budget is spent -
//! cancels the reservation so the user is refunded exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use carousel::{JobData, JobHandler, Outcome};

use crate::jobs::{GenerationJob, MATERIALIZATION_QUEUE, MaterializationJob, MaterializationSource};
use crate::providers::{GenerateOutput, ProviderError, ProviderRegistry};
use crate::store::{AssetStatus, FailureDisposition, ReservationStatus, Store, StoreError};
use crate::types::abbrev_uuid;

pub struct GenerationHandler<Q: carousel::Storage> {
    store: Arc<dyn Store>,
    registry: ProviderRegistry,
    queue: Arc<Q>,
    max_attempts: i32,
}

impl<Q: carousel::Storage> GenerationHandler<Q> {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ProviderRegistry,
        queue: Arc<Q>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            max_attempts: max_attempts as i32,
        }
    }

    /// Commit the reservation for a confirmed success.
    ///
    /// Tolerates a reservation already committed by an earlier delivery of
    /// the same job (the handoff may have crashed between commit and
    /// enqueue); anything else is a defect.
    async fn commit_for_success(&self, job: &GenerationJob) -> Result<(), Outcome> {
        match self.store.commit_reservation(job.reservation_id).await {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidReservationState {
                actual: ReservationStatus::Completed,
                ..
            }) => {
                tracing::info!(
                    reservation = %abbrev_uuid(&job.reservation_id),
                    "Reservation already committed by an earlier delivery; continuing handoff"
                );
                Ok(())
            }
            Err(e) => {
                // Refunded-then-succeeded, or the store is down. Either way
                // the output cannot be settled against this reservation.
                tracing::error!(
                    reservation = %abbrev_uuid(&job.reservation_id),
                    error = %e,
                    "Could not commit reservation for a successful generation"
                );
                let _ = self
                    .store
                    .mark_asset_failed(job.asset_id, "Generation succeeded but commit failed")
                    .await;
                Err(Outcome::Discard(format!("commit failed: {e}")))
            }
        }
    }

    /// Queue the materialization stage. The reservation is committed by
    /// now, so a failure here is a recorded inconsistency (asset FAILED
    /// with a distinguishing reason), never a refund - the provider has
    /// already been paid.
    async fn hand_off(&self, job: &GenerationJob, source: MaterializationSource) -> Outcome {
        let mat_job = MaterializationJob {
            asset_id: job.asset_id,
            source,
        };
        let payload = match serde_json::to_value(&mat_job) {
            Ok(payload) => payload,
            Err(e) => return Outcome::Discard(format!("unserializable materialization job: {e}")),
        };

        match carousel::submit(self.queue.as_ref(), MATERIALIZATION_QUEUE, payload).await {
            Ok(_) => Outcome::Complete,
            Err(e) => {
                tracing::error!(
                    asset = %abbrev_uuid(&job.asset_id),
                    error = %e,
                    "Failed to hand off to the materialization queue"
                );
                let _ = self
                    .store
                    .mark_asset_failed(job.asset_id, "Failed to queue for materialization")
                    .await;
                Outcome::Discard(format!("materialization handoff failed: {e}"))
            }
        }
    }

    /// Route a failure through the asset-row attempt counter, which decides
    /// retry-vs-refund in the same atomic unit it increments in.
    async fn settle_failure(&self, job: &GenerationJob, reason: &str, permanent: bool) -> Outcome {
        match self
            .store
            .record_generation_failure(job.asset_id, reason, self.max_attempts, permanent)
            .await
        {
            Ok(FailureDisposition::Retry { attempt }) => {
                tracing::warn!(
                    asset = %abbrev_uuid(&job.asset_id),
                    attempt,
                    max_attempts = self.max_attempts,
                    "Generation failed, queue will redeliver"
                );
                Outcome::Retry(reason.to_string())
            }
            Ok(FailureDisposition::Refunded) => {
                tracing::warn!(
                    asset = %abbrev_uuid(&job.asset_id),
                    reservation = %abbrev_uuid(&job.reservation_id),
                    "Generation failed terminally, hold released"
                );
                Outcome::Discard(reason.to_string())
            }
            Err(e) => {
                // Couldn't record the failure; let the queue try again so
                // the decision is not lost.
                tracing::error!(
                    asset = %abbrev_uuid(&job.asset_id),
                    error = %e,
                    "Failed to record generation failure"
                );
                Outcome::Retry(reason.to_string())
            }
        }
    }
}

#[async_trait]
impl<Q: carousel::Storage> JobHandler for GenerationHandler<Q> {
    async fn handle(&self, data: &JobData) -> Outcome {
        let job: GenerationJob = match serde_json::from_value(data.payload.clone()) {
            Ok(job) => job,
            Err(e) => return Outcome::Discard(format!("malformed generation job: {e}")),
        };

        // At-least-once delivery: a redelivered job whose asset already
        // moved past the generation stage - or was already handed to a
        // provider queue (request id recorded) - must not run again.
        match self.store.get_asset(job.asset_id).await {
            Ok(asset)
                if asset.status != AssetStatus::Pending
                    || asset.provider_request_id.is_some() =>
            {
                tracing::info!(
                    asset = %abbrev_uuid(&job.asset_id),
                    status = ?asset.status,
                    "Asset already past generation; duplicate delivery is a no-op"
                );
                return Outcome::Complete;
            }
            Ok(_) => {}
            Err(e) => return Outcome::Retry(format!("failed to load asset: {e}")),
        }

        let Some(adapter) = self.registry.resolve(&job.provider, &job.model) else {
            // Catalog references an unregistered adapter; retrying can't fix it
            return self
                .settle_failure(
                    &job,
                    &format!("No provider registered for {}/{}", job.provider, job.model),
                    true,
                )
                .await;
        };

        tracing::info!(
            asset = %abbrev_uuid(&job.asset_id),
            provider = %job.provider,
            model = %job.model,
            "Starting generation"
        );

        match adapter.generate(&job.input).await {
            Ok(GenerateOutput::Inline {
                b64,
                provider_request_id,
            }) => {
                if let Err(outcome) = self.commit_for_success(&job).await {
                    return outcome;
                }
                // Inline output is not visible until persisted: UPLOADING,
                // and flip before enqueueing so the materialization worker
                // can never lose the race against this update.
                if let Err(e) = self
                    .store
                    .mark_asset_uploading(job.asset_id, provider_request_id.as_deref())
                    .await
                {
                    return Outcome::Discard(format!("failed to mark asset uploading: {e}"));
                }
                self.hand_off(&job, MaterializationSource::Inline { b64 }).await
            }
            Ok(GenerateOutput::Url {
                url,
                provider_request_id,
            }) => {
                if let Err(outcome) = self.commit_for_success(&job).await {
                    return outcome;
                }
                // A URL can be shown immediately: GENERATED at the
                // provider's (ephemeral) URL, permanent storage happens in
                // the background.
                if let Some(request_id) = provider_request_id.as_deref() {
                    if let Err(e) = self.store.set_asset_submitted(job.asset_id, request_id).await
                    {
                        return Outcome::Discard(format!("failed to record request id: {e}"));
                    }
                }
                if let Err(e) = self.store.mark_asset_generated(job.asset_id, &url).await {
                    return Outcome::Discard(format!("failed to mark asset generated: {e}"));
                }
                self.hand_off(&job, MaterializationSource::Url { url }).await
            }
            Ok(GenerateOutput::Submitted {
                provider_request_id,
            }) => {
                // The provider will call our webhook with the results; the
                // reconciler commits then. Funds stay held, asset stays
                // PENDING with the correlation id recorded.
                match self
                    .store
                    .set_asset_submitted(job.asset_id, &provider_request_id)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(
                            asset = %abbrev_uuid(&job.asset_id),
                            provider_request_id = %provider_request_id,
                            "Submitted to provider queue; awaiting webhook"
                        );
                        Outcome::Complete
                    }
                    Err(e) => Outcome::Retry(format!("failed to record request id: {e}")),
                }
            }
            Err(ProviderError::Transient(reason)) => self.settle_failure(&job, &reason, false).await,
            Err(ProviderError::Permanent(reason)) => self.settle_failure(&job, &reason, true).await,
        }
    }
}
