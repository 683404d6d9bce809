//! Daemon for processing queued jobs with bounded concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::job::{JobData, RetryPolicy, WorkerId};
use crate::storage::Storage;

/// What a handler decided about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job's work is done; mark it completed.
    Complete,
    /// The work failed but may succeed later; the queue schedules a
    /// redelivery with backoff (until the retry policy is exhausted).
    Retry(String),
    /// The work failed terminally and the handler has already performed any
    /// compensation it needed; record the failure and do not redeliver.
    Discard(String),
}

/// The work performed for each claimed job.
///
/// Implementations own their side effects entirely; the daemon only drives
/// the job lifecycle around the returned [`Outcome`]. Delivery is
/// at-least-once, so handlers must tolerate seeing the same job twice.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobData) -> Outcome;
}

/// Configuration for a queue daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Name of the queue this daemon drains.
    pub queue: String,

    /// Maximum number of jobs to claim in each iteration.
    pub claim_batch_size: usize,

    /// Maximum number of jobs processed concurrently.
    pub concurrency: usize,

    /// How long to sleep between claim iterations when the queue is empty.
    pub claim_interval_ms: u64,

    /// Maximum number of retry attempts before giving up.
    ///
    /// Note: handlers that track their own attempt budget (see
    /// [`Outcome::Discard`]) should be given headroom here; this limit is a
    /// backstop against jobs that retry forever.
    pub max_retries: u32,

    /// Base backoff duration in milliseconds (exponentially increased).
    pub backoff_ms: u64,

    /// Factor by which the backoff is increased with each retry.
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds.
    pub max_backoff_ms: u64,

    /// Claims older than this are considered orphaned by a crashed worker
    /// and swept back to pending at the start of each iteration.
    pub stale_claim_after_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            claim_batch_size: 20,
            concurrency: 5,
            claim_interval_ms: 1000,
            max_retries: 5,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            stale_claim_after_ms: 600_000, // 10 minutes
        }
    }
}

/// Daemon that drains one queue.
///
/// The daemon continuously claims pending jobs from storage, dispatches them
/// to the handler under a concurrency limit, and applies the retry policy to
/// failures.
pub struct Daemon<S, H>
where
    S: Storage,
    H: JobHandler,
{
    worker_id: WorkerId,
    storage: Arc<S>,
    handler: Arc<H>,
    config: DaemonConfig,
    semaphore: Arc<Semaphore>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl<S, H> Daemon<S, H>
where
    S: Storage + 'static,
    H: JobHandler + 'static,
{
    /// Create a new daemon.
    pub fn new(storage: Arc<S>, handler: Arc<H>, config: DaemonConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            worker_id: WorkerId::new_v4(),
            storage,
            handler,
            config,
            semaphore,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of jobs currently being processed.
    pub fn jobs_in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    /// Run the daemon loop.
    ///
    /// This continuously claims and processes jobs until a storage error
    /// occurs or the task is cancelled.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue, worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Daemon starting main processing loop");

        let retry_policy = RetryPolicy::from(&self.config);
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks (non-blocking)
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Job task panicked");
                }
            }

            // Sweep claims orphaned by crashed workers
            let stale_cutoff = chrono::Utc::now()
                - chrono::Duration::milliseconds(self.config.stale_claim_after_ms as i64);
            self.storage
                .release_stale(&self.config.queue, stale_cutoff)
                .await?;

            // Don't claim more than we have capacity to run
            let capacity = self.semaphore.available_permits();
            if capacity == 0 {
                tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)).await;
                continue;
            }

            let claimed = self
                .storage
                .claim(
                    &self.config.queue,
                    capacity.min(self.config.claim_batch_size),
                    self.worker_id,
                )
                .await?;

            if claimed.is_empty() {
                tracing::trace!("No pending jobs, sleeping");
                tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)).await;
                continue;
            }

            tracing::debug!(claimed_count = claimed.len(), "Claimed jobs from storage");

            for job in claimed {
                let permit = match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Claimed past capacity; hand the job back untouched
                        if let Err(e) = job.release(self.storage.as_ref()).await {
                            tracing::error!(error = %e, "Failed to release over-claimed job");
                        }
                        continue;
                    }
                };

                let job_id = job.data.id;
                let storage = self.storage.clone();
                let handler = self.handler.clone();
                let jobs_in_flight = self.jobs_in_flight.clone();

                jobs_in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    // Permit is held for the duration of this task
                    let _permit = permit;
                    let _guard = scopeguard::guard((), |_| {
                        jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    tracing::info!(job_id = %job_id, "Processing job");

                    let outcome = handler.handle(&job.data).await;

                    let result = match outcome {
                        Outcome::Complete => job
                            .complete(storage.as_ref())
                            .await
                            .map(|_| tracing::info!(job_id = %job_id, "Job completed")),
                        Outcome::Retry(error) => {
                            tracing::warn!(job_id = %job_id, error = %error, "Job failed, attempting retry");
                            match job.fail(error, storage.as_ref()).await {
                                Ok(failed) => failed
                                    .retry(retry_policy, storage.as_ref())
                                    .await
                                    .map(|requeued| {
                                        if requeued.is_none() {
                                            tracing::warn!(
                                                job_id = %job_id,
                                                "Job failed permanently (no retries remaining)"
                                            );
                                        }
                                    }),
                                Err(e) => Err(e),
                            }
                        }
                        Outcome::Discard(error) => {
                            tracing::warn!(job_id = %job_id, error = %error, "Job discarded by handler");
                            job.fail(error, storage.as_ref()).await.map(|_| ())
                        }
                    };

                    if let Err(e) = result {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to persist job outcome");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory::InMemoryStorage;
    use crate::{AnyJob, Storage};
    use parking_lot::Mutex;

    /// Handler scripted with a fixed sequence of outcomes per run.
    struct ScriptedHandler {
        outcomes: Mutex<Vec<Outcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &JobData) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                Outcome::Complete
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn fast_config(queue: &str) -> DaemonConfig {
        DaemonConfig {
            queue: queue.to_string(),
            claim_batch_size: 10,
            concurrency: 5,
            claim_interval_ms: 5,
            max_retries: 5,
            backoff_ms: 5,
            backoff_factor: 2,
            max_backoff_ms: 20,
            stale_claim_after_ms: 60_000,
        }
    }

    async fn wait_for_terminal(
        storage: &InMemoryStorage,
        id: crate::JobId,
        timeout: Duration,
    ) -> AnyJob {
        let start = tokio::time::Instant::now();
        loop {
            let jobs = storage.get(vec![id]).await.unwrap();
            let job = jobs.into_iter().next().unwrap().unwrap();
            if job.is_terminal() {
                return job;
            }
            if start.elapsed() > timeout {
                panic!("Job did not reach a terminal state within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn daemon_claims_and_completes_job() {
        let storage = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Outcome::Complete]));

        let daemon = Arc::new(Daemon::new(
            storage.clone(),
            handler.clone(),
            fast_config("test"),
        ));
        let handle = tokio::spawn(daemon.run());

        let id = crate::submit(storage.as_ref(), "test", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let job = wait_for_terminal(&storage, id, Duration::from_secs(2)).await;
        handle.abort();

        assert!(matches!(job, AnyJob::Completed(_)));
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn daemon_retries_until_success() {
        let storage = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(ScriptedHandler::new(vec![
            Outcome::Retry("first failure".to_string()),
            Outcome::Retry("second failure".to_string()),
            Outcome::Complete,
        ]));

        let daemon = Arc::new(Daemon::new(
            storage.clone(),
            handler.clone(),
            fast_config("test"),
        ));
        let handle = tokio::spawn(daemon.run());

        let id = crate::submit(storage.as_ref(), "test", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let job = wait_for_terminal(&storage, id, Duration::from_secs(5)).await;
        handle.abort();

        assert!(matches!(job, AnyJob::Completed(_)));
        assert_eq!(handler.call_count(), 3, "two failures plus one success");
    }

    #[tokio::test]
    async fn daemon_stops_retrying_after_policy_exhausted() {
        let storage = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(ScriptedHandler::new(vec![
            Outcome::Retry("1".to_string()),
            Outcome::Retry("2".to_string()),
            Outcome::Retry("3".to_string()),
        ]));

        let mut config = fast_config("test");
        config.max_retries = 2;
        let daemon = Arc::new(Daemon::new(storage.clone(), handler.clone(), config));
        let handle = tokio::spawn(daemon.run());

        let id = crate::submit(storage.as_ref(), "test", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        // Terminal failure: initial attempt + 2 retries, all failing
        let start = tokio::time::Instant::now();
        loop {
            let jobs = storage.get(vec![id]).await.unwrap();
            let job = jobs.into_iter().next().unwrap().unwrap();
            if let AnyJob::Failed(failed) = &job {
                if failed.state.retry_attempt == 2 && handler.call_count() == 3 {
                    // Give the daemon a beat to prove it won't redeliver
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    break;
                }
            }
            if start.elapsed() > Duration::from_secs(5) {
                panic!("Job never exhausted retries");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn discard_outcome_is_not_redelivered() {
        let storage = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Outcome::Discard(
            "terminal".to_string(),
        )]));

        let daemon = Arc::new(Daemon::new(
            storage.clone(),
            handler.clone(),
            fast_config("test"),
        ));
        let handle = tokio::spawn(daemon.run());

        let id = crate::submit(storage.as_ref(), "test", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let job = wait_for_terminal(&storage, id, Duration::from_secs(2)).await;
        // Let a few claim intervals pass; the job must stay failed
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(matches!(job, AnyJob::Failed(_)));
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn daemon_only_drains_its_own_queue() {
        let storage = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(ScriptedHandler::new(vec![]));

        let daemon = Arc::new(Daemon::new(
            storage.clone(),
            handler.clone(),
            fast_config("mine"),
        ));
        let handle = tokio::spawn(daemon.run());

        let mine = crate::submit(storage.as_ref(), "mine", serde_json::json!({}))
            .await
            .unwrap();
        let other = crate::submit(storage.as_ref(), "other", serde_json::json!({}))
            .await
            .unwrap();

        wait_for_terminal(&storage, mine, Duration::from_secs(2)).await;
        handle.abort();

        let jobs = storage.get(vec![other]).await.unwrap();
        assert!(
            matches!(jobs[0].as_ref().unwrap(), AnyJob::Pending(_)),
            "foreign queue's job must remain untouched"
        );
    }
}
