use crate::error::Result;
use crate::storage::Storage;

use super::types::{Claimed, Completed, Failed, Job, Pending};

impl Job<Claimed> {
    /// Return a claimed job to the pending pool without an attempt charge.
    ///
    /// Used when a daemon shuts down with claimed-but-unstarted jobs, or
    /// when capacity was not available after all.
    pub async fn release<S: Storage + ?Sized>(self, storage: &S) -> Result<Job<Pending>> {
        let job = Job {
            data: self.data,
            state: Pending {
                retry_attempt: self.state.retry_attempt,
                not_before: None, // claimable immediately
            },
        };
        storage.persist(&job).await?;
        Ok(job)
    }

    /// Mark a claimed job as successfully completed.
    pub async fn complete<S: Storage + ?Sized>(self, storage: &S) -> Result<Job<Completed>> {
        let job = Job {
            data: self.data,
            state: Completed {
                completed_at: chrono::Utc::now(),
            },
        };
        storage.persist(&job).await?;
        Ok(job)
    }

    /// Mark a claimed job as failed.
    ///
    /// The attempt counter carries over; whether the job is retried is
    /// decided afterwards via [`Job::<Failed>::retry`].
    pub async fn fail<S: Storage + ?Sized>(
        self,
        error: String,
        storage: &S,
    ) -> Result<Job<Failed>> {
        let job = Job {
            data: self.data,
            state: Failed {
                error,
                failed_at: chrono::Utc::now(),
                retry_attempt: self.state.retry_attempt,
            },
        };
        storage.persist(&job).await?;
        Ok(job)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Exponential backoff for a given attempt: `backoff_ms * factor^attempt`,
    /// capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry_attempt: u32) -> chrono::Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt));
        chrono::Duration::milliseconds(exponential.min(self.max_backoff_ms) as i64)
    }
}

impl From<&crate::daemon::DaemonConfig> for RetryPolicy {
    fn from(config: &crate::daemon::DaemonConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl Job<Failed> {
    /// Attempt to retry this failed job.
    ///
    /// If retries are available, transitions the job back to Pending with:
    /// - Incremented retry_attempt
    /// - Calculated not_before timestamp for exponential backoff
    ///
    /// If no retries remain, returns None and the job stays Failed.
    pub async fn retry<S: Storage + ?Sized>(
        self,
        policy: RetryPolicy,
        storage: &S,
    ) -> Result<Option<Job<Pending>>> {
        let retry_attempt = self.state.retry_attempt;

        if retry_attempt >= policy.max_retries {
            tracing::debug!(
                job_id = %self.data.id,
                retry_attempt,
                max_retries = policy.max_retries,
                "No retries remaining, job remains failed"
            );
            return Ok(None);
        }

        let backoff = policy.backoff_for(retry_attempt);
        let not_before = chrono::Utc::now() + backoff;

        tracing::info!(
            job_id = %self.data.id,
            retry_attempt = retry_attempt + 1,
            backoff_ms = backoff.num_milliseconds(),
            not_before = %not_before,
            "Retrying failed job with exponential backoff"
        );

        let job = Job {
            data: self.data,
            state: Pending {
                retry_attempt: retry_attempt + 1,
                not_before: Some(not_before),
            },
        };

        storage.persist(&job).await?;
        Ok(Some(job))
    }
}
