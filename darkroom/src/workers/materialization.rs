//! Materialization stage worker.
//!
//! Copies a transient provider output - a soon-to-expire URL or an inline
//! base64 payload - into our own blob store and flips the asset to its
//! terminal GENERATED state at the permanent URL. Funds were committed when
//! generation succeeded, so failures here retry on this queue's own budget
//! and never trigger a refund.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use carousel::{JobData, JobHandler, Outcome};

use crate::blobstore::BlobStore;
use crate::jobs::{MaterializationJob, MaterializationSource};
use crate::store::Store;
use crate::types::abbrev_uuid;

pub struct MaterializationHandler {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    client: reqwest::Client,
    /// Outputs smaller than this are rejected as upstream errors.
    min_output_bytes: usize,
}

impl MaterializationHandler {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, min_output_bytes: usize) -> Self {
        Self {
            store,
            blobs,
            client: reqwest::Client::new(),
            min_output_bytes,
        }
    }

    /// Fetch the image bytes and their content type from the job source.
    ///
    /// `Err((reason, retriable))`: decode failures are permanent, network
    /// failures are worth retrying.
    async fn fetch(&self, source: &MaterializationSource) -> Result<(Bytes, String), (String, bool)> {
        match source {
            MaterializationSource::Url { url } => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| (format!("download failed: {e}"), true))?;

                if !response.status().is_success() {
                    return Err((
                        format!("download returned HTTP {}", response.status()),
                        true,
                    ));
                }

                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("image/png")
                    .to_string();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| (format!("download body failed: {e}"), true))?;
                Ok((bytes, content_type))
            }
            MaterializationSource::Inline { b64 } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| (format!("invalid base64 payload: {e}"), false))?;
                Ok((Bytes::from(bytes), "image/png".to_string()))
            }
        }
    }

    /// Record the failure on the asset and map it to a queue outcome.
    async fn settle_failure(&self, job: &MaterializationJob, reason: &str, retriable: bool) -> Outcome {
        if let Err(e) = self
            .store
            .record_materialization_failure(job.asset_id, reason)
            .await
        {
            tracing::error!(
                asset = %abbrev_uuid(&job.asset_id),
                error = %e,
                "Failed to record materialization failure"
            );
        }
        if retriable {
            Outcome::Retry(reason.to_string())
        } else {
            Outcome::Discard(reason.to_string())
        }
    }
}

#[async_trait]
impl JobHandler for MaterializationHandler {
    async fn handle(&self, data: &JobData) -> Outcome {
        let job: MaterializationJob = match serde_json::from_value(data.payload.clone()) {
            Ok(job) => job,
            Err(e) => return Outcome::Discard(format!("malformed materialization job: {e}")),
        };

        tracing::info!(asset = %abbrev_uuid(&job.asset_id), "Materializing output");

        let (bytes, content_type) = match self.fetch(&job.source).await {
            Ok(fetched) => fetched,
            Err((reason, retriable)) => return self.settle_failure(&job, &reason, retriable).await,
        };

        if bytes.len() < self.min_output_bytes {
            // A near-empty body is an upstream error page or truncation,
            // not an image.
            return self
                .settle_failure(
                    &job,
                    &format!(
                        "output is {} bytes, below the {}-byte sanity threshold",
                        bytes.len(),
                        self.min_output_bytes
                    ),
                    true,
                )
                .await;
        }

        let permanent_url = match self.blobs.put(bytes, &content_type).await {
            Ok(url) => url,
            Err(e) => {
                return self
                    .settle_failure(&job, &format!("blob upload failed: {e}"), true)
                    .await;
            }
        };

        match self
            .store
            .mark_asset_generated(job.asset_id, &permanent_url)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    asset = %abbrev_uuid(&job.asset_id),
                    url = %permanent_url,
                    "Asset materialized"
                );
                Outcome::Complete
            }
            Err(e) => {
                self.settle_failure(&job, &format!("final asset update failed: {e}"), true)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::InMemoryBlobStore;
    use crate::store::{AssetStatus, InMemoryStore};
    use rust_decimal::Decimal;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PIXEL_PNG_B64: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    async fn setup() -> (Arc<InMemoryStore>, Arc<InMemoryBlobStore>, MaterializationHandler, crate::types::AssetId) {
        let store = Arc::new(InMemoryStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let account = store.create_account(Decimal::from(100)).await.unwrap();
        let (_, assets) = store.reserve(account.id, Decimal::ONE, 1).await.unwrap();
        let handler = MaterializationHandler::new(
            store.clone() as Arc<dyn Store>,
            blobs.clone() as Arc<dyn BlobStore>,
            16,
        );
        (store, blobs, handler, assets[0].id)
    }

    fn job_data(job: &MaterializationJob) -> JobData {
        JobData {
            id: carousel::JobId::from(uuid::Uuid::new_v4()),
            queue: crate::jobs::MATERIALIZATION_QUEUE.to_string(),
            payload: serde_json::to_value(job).unwrap(),
            submitted_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn inline_payload_is_decoded_and_stored() {
        let (store, blobs, handler, asset_id) = setup().await;

        let outcome = handler
            .handle(&job_data(&MaterializationJob {
                asset_id,
                source: MaterializationSource::Inline {
                    b64: PIXEL_PNG_B64.to_string(),
                },
            }))
            .await;

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(blobs.object_count(), 1);

        let asset = store.get_asset(asset_id).await.unwrap();
        assert_eq!(asset.status, AssetStatus::Generated);
        assert!(asset.output_location.unwrap().starts_with("memory://"));
    }

    #[tokio::test]
    async fn url_source_is_downloaded() {
        let (store, blobs, handler, asset_id) = setup().await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xFFu8; 128]),
            )
            .mount(&server)
            .await;

        let outcome = handler
            .handle(&job_data(&MaterializationJob {
                asset_id,
                source: MaterializationSource::Url {
                    url: format!("{}/image.jpg", server.uri()),
                },
            }))
            .await;

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(blobs.object_count(), 1);
        let asset = store.get_asset(asset_id).await.unwrap();
        assert!(asset.output_location.unwrap().ends_with(".jpg"));
    }

    #[tokio::test]
    async fn near_empty_output_is_rejected_and_retried() {
        let (store, blobs, handler, asset_id) = setup().await;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let outcome = handler
            .handle(&job_data(&MaterializationJob {
                asset_id,
                source: MaterializationSource::Url {
                    url: format!("{}/tiny.png", server.uri()),
                },
            }))
            .await;

        assert!(matches!(outcome, Outcome::Retry(_)));
        assert_eq!(blobs.object_count(), 0);

        let asset = store.get_asset(asset_id).await.unwrap();
        assert_eq!(asset.status, AssetStatus::Failed);
        assert_eq!(asset.attempt, 1);
        assert!(asset.fail_reason.unwrap().contains("sanity threshold"));
    }

    #[tokio::test]
    async fn invalid_base64_is_discarded() {
        let (store, _, handler, asset_id) = setup().await;

        let outcome = handler
            .handle(&job_data(&MaterializationJob {
                asset_id,
                source: MaterializationSource::Inline {
                    b64: "not-base64!!!".to_string(),
                },
            }))
            .await;

        assert!(matches!(outcome, Outcome::Discard(_)));
        let asset = store.get_asset(asset_id).await.unwrap();
        assert_eq!(asset.status, AssetStatus::Failed);
    }

    #[tokio::test]
    async fn download_failure_does_not_touch_the_reservation() {
        let (store, _, handler, asset_id) = setup().await;
        let asset = store.get_asset(asset_id).await.unwrap();
        let account_before = store.get_account(asset.account_id).await.unwrap();

        let outcome = handler
            .handle(&job_data(&MaterializationJob {
                asset_id,
                source: MaterializationSource::Url {
                    // Nothing listens here
                    url: "http://127.0.0.1:1/missing.png".to_string(),
                },
            }))
            .await;

        assert!(matches!(outcome, Outcome::Retry(_)));
        let account_after = store.get_account(asset.account_id).await.unwrap();
        assert_eq!(account_before.balance, account_after.balance);
        assert_eq!(account_before.held, account_after.held);
    }
}
