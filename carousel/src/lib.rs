//! Durable work queues with retry logic and concurrency control.
//!
//! This crate provides an at-least-once job queue that:
//! - Accepts jobs carrying an arbitrary JSON payload
//! - Manages job lifecycle with type-safe state transitions
//! - Implements retry logic with exponential backoff
//! - Enforces a per-queue concurrency limit
//! - Recovers jobs orphaned by crashed workers
//!
//! # Example
//! ```ignore
//! use carousel::{Daemon, DaemonConfig, InMemoryStorage, JobHandler, Outcome};
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let daemon = Arc::new(Daemon::new(storage.clone(), handler, DaemonConfig::default()));
//!
//! // Start the processing loop
//! let handle = tokio::spawn(daemon.run());
//!
//! // Submit jobs
//! let id = carousel::submit(storage.as_ref(), "generation", payload).await?;
//! ```

pub mod daemon;
pub mod error;
pub mod job;
pub mod storage;

// Re-export commonly used types
pub use daemon::{Daemon, DaemonConfig, JobHandler, Outcome};
pub use error::{CarouselError, Result};
pub use job::*;
pub use storage::in_memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStorage;
pub use storage::Storage;

use chrono::Utc;

/// Submit a new job with the given payload onto a queue.
///
/// Convenience wrapper that builds the `Pending` job and persists it.
pub async fn submit<S: Storage + ?Sized>(
    storage: &S,
    queue: &str,
    payload: serde_json::Value,
) -> Result<JobId> {
    let job = Job {
        state: Pending {
            retry_attempt: 0,
            not_before: None,
        },
        data: JobData {
            id: JobId::from(uuid::Uuid::new_v4()),
            queue: queue.to_string(),
            payload,
            submitted_at: Utc::now(),
        },
    };
    let id = job.data.id;
    storage.submit(job).await?;
    Ok(id)
}
