use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{AnyJob, Claimed, Job, JobId, JobState, Pending, WorkerId};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage trait for persisting and querying jobs.
///
/// This trait provides atomic operations for job lifecycle management.
/// The type system ensures valid state transitions, so implementations don't
/// need to validate them.
pub trait Storage: Send + Sync {
    /// Submit a new pending job to storage.
    ///
    /// # Errors
    /// - If a job with the same ID already exists
    fn submit(&self, job: Job<Pending>) -> impl Future<Output = Result<()>> + Send;

    /// Atomically claim pending jobs from a queue for processing.
    ///
    /// This operation transitions jobs from `Pending` to `Claimed` state
    /// atomically, preventing race conditions when multiple daemons operate
    /// concurrently. Jobs whose `not_before` lies in the future are skipped.
    ///
    /// # Arguments
    /// - `queue` - The queue to claim from
    /// - `limit` - Maximum number of jobs to claim
    /// - `worker_id` - ID of the daemon claiming these jobs
    ///
    /// # Returns
    /// Vector of successfully claimed jobs, oldest first. May return fewer
    /// than `limit` if insufficient claimable jobs are available.
    fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker_id: WorkerId,
    ) -> impl Future<Output = Result<Vec<Job<Claimed>>>> + Send;

    /// Update an existing job's state in storage.
    ///
    /// The type system ensures valid state transitions, so this method just
    /// persists the new state without validation. Completed jobs refuse
    /// further writes (idempotency protection under duplicate delivery).
    ///
    /// # Errors
    /// - `JobNotFound` - if the job doesn't exist
    fn persist<T: JobState + Clone>(
        &self,
        job: &Job<T>,
    ) -> impl Future<Output = Result<()>> + Send
    where
        AnyJob: From<Job<T>>;

    /// View the pending jobs on a queue (read-only).
    ///
    /// This is a non-mutating query, useful for monitoring. For claiming
    /// jobs, use `claim` instead.
    fn view_pending(
        &self,
        queue: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job<Pending>>>> + Send;

    /// Get jobs by IDs.
    ///
    /// Returns the current job (in whatever state) for each requested ID.
    /// If a job doesn't exist, that entry will be an error.
    fn get(&self, ids: Vec<JobId>) -> impl Future<Output = Result<Vec<Result<AnyJob>>>> + Send;

    /// Return claimed jobs whose claim predates `claimed_before` to Pending.
    ///
    /// This handles daemon crashes: a job claimed by a worker that died is
    /// eventually swept back into the pending pool without losing its
    /// attempt count. Returns the number of jobs released.
    fn release_stale(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;
}
