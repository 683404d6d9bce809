//! # darkroom: credit-metered AI image generation
//!
//! `darkroom` lets a user spend a prepaid credit balance to request
//! AI-generated images from external inference providers. Provider calls
//! are slow, unreliable, and billed externally, so the heart of the system
//! is not the HTTP surface - it is guaranteeing that credits are reserved,
//! charged, and refunded **exactly once** across an asynchronous,
//! multi-stage, failure-prone pipeline.
//!
//! ## Request flow
//!
//! A generation request is priced from the catalog and validated by the
//! matching provider adapter before any money moves. The
//! [`reservations::ReservationManager`] then holds the funds: the account's
//! `held` counter goes up, a PROCESSING [`store::Reservation`] and the
//! placeholder [`store::Asset`] rows are created in the same atomic unit,
//! and one generation job per asset lands on the queue. The client gets a
//! 202 and a status URL; from here on everything is asynchronous.
//!
//! The generation worker ([`workers::GenerationHandler`]) claims the job
//! and calls the adapter. Three shapes of success exist: inline bytes
//! (commit the reservation, mark the asset UPLOADING, hand the payload to
//! the materialization queue), a hosted URL (commit, show the ephemeral
//! URL immediately as GENERATED, materialize in the background), or a
//! queue submission (record the provider's request id and wait for its
//! webhook). Failures go through the asset row's attempt counter: while
//! attempts remain the queue redelivers with backoff and the user's hold is
//! untouched; once the budget is spent - or the failure is permanent - the
//! reservation is cancelled and the hold released, exactly once.
//!
//! The materialization worker ([`workers::MaterializationHandler`]) copies
//! provider output into our own blob store and flips the asset to
//! GENERATED at its permanent URL. Its failures retry on an independent
//! budget and never refund: the provider has already been paid.
//!
//! Webhook-flavored providers deliver results to `/api/v1/webhooks/{provider}`,
//! where the [`webhooks::Reconciler`] correlates them back to the pending
//! assets by provider request id, rejects ambiguous deliveries (output
//! count mismatch), applies the batch atomically, and treats replays as
//! no-ops.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); PostgreSQL
//! holds the ledger, saga, and catalog (with an in-memory [`store::Store`]
//! backend for tests and development). The queues are
//! [carousel](../carousel/index.html) daemons - durable, at-least-once,
//! with per-stage concurrency and exponential-backoff retry. Blob storage
//! is S3-compatible (or local filesystem in development).

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

pub mod api;
pub mod blobstore;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod providers;
pub mod reservations;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod webhooks;
pub mod workers;

pub use config::Config;
pub use errors::{Error, Result};

use blobstore::BlobStore;
use carousel::{Daemon, DaemonConfig, PostgresStorage};
use config::{BlobConfig, StageConfig};
use providers::ProviderRegistry;
use reservations::ReservationManager;
use store::{PostgresStore, Store};
use webhooks::Reconciler;
use workers::{GenerationHandler, MaterializationHandler};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<PostgresStorage>,
    pub manager: Arc<ReservationManager<PostgresStorage>>,
    pub reconciler: Arc<Reconciler<PostgresStorage>>,
    pub config: Arc<Config>,
}

/// The assembled application: database pool, queue daemons, HTTP server.
pub struct Application {
    config: Config,
    state: AppState,
    daemon_handles: Vec<tokio::task::JoinHandle<carousel::Result<()>>>,
}

fn daemon_config(queue: &str, stage: &StageConfig) -> DaemonConfig {
    DaemonConfig {
        queue: queue.to_string(),
        claim_batch_size: stage.claim_batch_size,
        concurrency: stage.concurrency,
        claim_interval_ms: stage.claim_interval_ms,
        // The asset row's counter is authoritative for the refund decision;
        // the queue budget gets one attempt of headroom as a backstop.
        max_retries: stage.max_attempts,
        backoff_ms: stage.backoff_ms,
        backoff_factor: stage.backoff_factor,
        max_backoff_ms: stage.max_backoff_ms,
        stale_claim_after_ms: stage.stale_claim_after_ms,
    }
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool.clone()));
        let queue = Arc::new(PostgresStorage::new(pool));
        let registry = ProviderRegistry::from_config(&config.providers);

        let blobs: Arc<dyn BlobStore> = match &config.blob {
            BlobConfig::S3 {
                bucket,
                public_base_url,
                endpoint,
            } => Arc::new(
                blobstore::S3BlobStore::from_env(
                    bucket.clone(),
                    public_base_url.clone(),
                    endpoint.clone(),
                )
                .await,
            ),
            BlobConfig::Local {
                directory,
                public_base_url,
            } => Arc::new(blobstore::LocalBlobStore::new(
                directory.clone(),
                public_base_url.clone(),
            )),
        };

        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config.max_assets_per_request,
        ));
        let reconciler = Arc::new(Reconciler::new(store.clone(), queue.clone()));

        // Stage 1: generation daemon
        let generation_daemon = Arc::new(Daemon::new(
            queue.clone(),
            Arc::new(GenerationHandler::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                config.workers.generation.max_attempts,
            )),
            daemon_config(jobs::GENERATION_QUEUE, &config.workers.generation),
        ));

        // Stage 2: materialization daemon
        let materialization_daemon = Arc::new(Daemon::new(
            queue.clone(),
            Arc::new(MaterializationHandler::new(
                store.clone(),
                blobs,
                config.workers.min_output_bytes,
            )),
            daemon_config(
                jobs::MATERIALIZATION_QUEUE,
                &config.workers.materialization,
            ),
        ));

        let daemon_handles = vec![
            tokio::spawn(generation_daemon.run()),
            tokio::spawn(materialization_daemon.run()),
        ];

        let state = AppState {
            store,
            queue,
            manager,
            reconciler,
            config: Arc::new(config.clone()),
        };

        Ok(Self {
            config,
            state,
            daemon_handles,
        })
    }

    /// Serve HTTP until the shutdown future resolves, then stop the
    /// daemons. In-flight jobs simply stay claimed and are swept back to
    /// pending by the stale-claim timeout on the next start.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        tracing::info!(addr = %addr, "darkroom listening");

        let router = api::router(self.state);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;

        for handle in self.daemon_handles {
            handle.abort();
        }
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
