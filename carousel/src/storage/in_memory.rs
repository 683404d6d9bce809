//! In-memory storage implementation for jobs.
//!
//! This implementation stores all jobs in memory using concurrent data
//! structures. It's suitable for testing and single-process deployments.
//! Jobs are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{CarouselError, Result};
use crate::job::*;

use super::Storage;

/// In-memory implementation of the Storage trait.
///
/// Stores all jobs in a shared HashMap behind an RwLock. Claims are atomic
/// with respect to concurrent daemons because the whole claim runs under the
/// write lock.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    jobs: Arc<RwLock<HashMap<JobId, AnyJob>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    async fn submit(&self, job: Job<Pending>) -> Result<()> {
        let job_id = job.data.id;

        let mut jobs = self.jobs.write();

        if jobs.contains_key(&job_id) {
            return Err(CarouselError::InvalidState(
                job_id,
                "exists".to_string(),
                "new".to_string(),
            ));
        }

        jobs.insert(job_id, job.into());
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<Job<Claimed>>> {
        let mut jobs = self.jobs.write();
        let now = Utc::now();

        let mut claimable: Vec<&Job<Pending>> = jobs
            .values()
            .filter_map(|j| j.as_pending())
            .filter(|j| j.data.queue == queue)
            .filter(|j| j.state.not_before.map_or(true, |t| t <= now))
            .collect();
        // Oldest first, like the Postgres backend's ORDER BY
        claimable.sort_by_key(|j| j.data.submitted_at);

        let claimed: Vec<Job<Claimed>> = claimable
            .into_iter()
            .take(limit)
            .map(|pending| Job {
                state: Claimed {
                    worker_id,
                    claimed_at: now,
                    retry_attempt: pending.state.retry_attempt,
                },
                data: pending.data.clone(),
            })
            .collect();

        for job in &claimed {
            jobs.insert(job.data.id, job.clone().into());
        }

        Ok(claimed)
    }

    async fn persist<T: JobState + Clone>(&self, job: &Job<T>) -> Result<()>
    where
        AnyJob: From<Job<T>>,
    {
        let job_id = job.data.id;

        let mut jobs = self.jobs.write();

        match jobs.get_mut(&job_id) {
            Some(existing) => {
                // Completed jobs are immutable (duplicate-delivery protection)
                if matches!(existing, AnyJob::Completed(_)) {
                    return Err(CarouselError::InvalidState(
                        job_id,
                        "completed".to_string(),
                        "modifiable state".to_string(),
                    ));
                }
                *existing = job.clone().into();
                Ok(())
            }
            None => Err(CarouselError::JobNotFound(job_id)),
        }
    }

    async fn view_pending(&self, queue: &str, limit: usize) -> Result<Vec<Job<Pending>>> {
        let jobs = self.jobs.read();

        let pending: Vec<Job<Pending>> = jobs
            .values()
            .filter_map(|j| j.as_pending())
            .filter(|j| j.data.queue == queue)
            .take(limit)
            .cloned()
            .collect();

        Ok(pending)
    }

    async fn get(&self, ids: Vec<JobId>) -> Result<Vec<Result<AnyJob>>> {
        let jobs = self.jobs.read();

        let results = ids
            .into_iter()
            .map(|id| {
                jobs.get(&id)
                    .cloned()
                    .ok_or(CarouselError::JobNotFound(id))
            })
            .collect();

        Ok(results)
    }

    async fn release_stale(&self, queue: &str, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write();

        let stale: Vec<JobId> = jobs
            .values()
            .filter_map(|j| match j {
                AnyJob::Claimed(c)
                    if c.data.queue == queue && c.state.claimed_at < claimed_before =>
                {
                    Some(c.data.id)
                }
                _ => None,
            })
            .collect();

        let count = stale.len() as u64;
        for id in stale {
            if let Some(AnyJob::Claimed(claimed)) = jobs.get(&id).cloned() {
                jobs.insert(
                    id,
                    AnyJob::Pending(Job {
                        state: Pending {
                            retry_attempt: claimed.state.retry_attempt,
                            not_before: None,
                        },
                        data: claimed.data,
                    }),
                );
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn sample_job(queue: &str) -> Job<Pending> {
        Job {
            state: Pending {
                retry_attempt: 0,
                not_before: None,
            },
            data: JobData {
                id: JobId::from(uuid::Uuid::new_v4()),
                queue: queue.to_string(),
                payload: serde_json::json!({"test": true}),
                submitted_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn submit_and_view_pending() {
        let storage = InMemoryStorage::new();
        let job = sample_job("generation");
        let id = job.data.id;

        storage.submit(job).await.unwrap();

        let pending = storage.view_pending("generation", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data.id, id);

        // Other queues see nothing
        let other = storage.view_pending("materialization", 10).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn duplicate_submit_is_rejected() {
        let storage = InMemoryStorage::new();
        let job = sample_job("generation");

        storage.submit(job.clone()).await.unwrap();
        let result = storage.submit(job).await;
        assert!(matches!(result, Err(CarouselError::InvalidState(..))));
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_workers() {
        let storage = InMemoryStorage::new();
        let worker1 = uuid::Uuid::new_v4();
        let worker2 = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        storage.submit(sample_job("generation")).await.unwrap();

        let claimed = storage.claim("generation", 10, worker1).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].state.worker_id, worker1);

        // Second worker gets nothing
        let claimed2 = storage.claim("generation", 10, worker2).await.unwrap();
        assert!(claimed2.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_not_before() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        let mut job = sample_job("generation");
        job.state.not_before = Some(Utc::now() + chrono::Duration::hours(1));
        storage.submit(job).await.unwrap();

        let claimed = storage.claim("generation", 10, worker).await.unwrap();
        assert!(claimed.is_empty(), "backoff gate should defer the claim");
    }

    #[tokio::test]
    async fn claim_only_from_requested_queue() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        storage.submit(sample_job("materialization")).await.unwrap();

        let claimed = storage.claim("generation", 10, worker).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].data.queue, "generation");
    }

    #[tokio::test]
    async fn completed_job_is_immutable() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        let claimed = storage.claim("generation", 1, worker).await.unwrap();
        let completed = claimed[0].clone().complete(&storage).await.unwrap();

        // Attempting to fail an already-completed job must be rejected
        let stale = Job {
            state: Failed {
                error: "late failure".to_string(),
                failed_at: Utc::now(),
                retry_attempt: 0,
            },
            data: completed.data.clone(),
        };
        let result = storage.persist(&stale).await;
        assert!(matches!(result, Err(CarouselError::InvalidState(..))));
    }

    #[tokio::test]
    async fn fail_then_retry_requeues_with_backoff() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        let claimed = storage.claim("generation", 1, worker).await.unwrap();
        let failed = claimed[0]
            .clone()
            .fail("boom".to_string(), &storage)
            .await
            .unwrap();

        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 50,
            backoff_factor: 2,
            max_backoff_ms: 1000,
        };
        let pending = failed.retry(policy, &storage).await.unwrap().unwrap();
        assert_eq!(pending.state.retry_attempt, 1);
        assert!(pending.state.not_before.is_some());
    }

    #[tokio::test]
    async fn retry_exhaustion_leaves_job_failed() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        let claimed = storage.claim("generation", 1, worker).await.unwrap();
        let id = claimed[0].data.id;

        let mut failed = claimed[0]
            .clone()
            .fail("boom".to_string(), &storage)
            .await
            .unwrap();
        failed.state.retry_attempt = 2;

        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 50,
            backoff_factor: 2,
            max_backoff_ms: 1000,
        };
        let result = failed.retry(policy, &storage).await.unwrap();
        assert!(result.is_none());

        let jobs = storage.get(vec![id]).await.unwrap();
        assert!(matches!(jobs[0].as_ref().unwrap(), AnyJob::Failed(_)));
    }

    #[tokio::test]
    async fn release_stale_returns_crashed_claims() {
        let storage = InMemoryStorage::new();
        let worker = uuid::Uuid::new_v4();

        storage.submit(sample_job("generation")).await.unwrap();
        let claimed = storage.claim("generation", 1, worker).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Sweep with a cutoff in the future: the claim is "stale"
        let released = storage
            .release_stale("generation", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let reclaimed = storage.claim("generation", 1, worker).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(
            reclaimed[0].state.retry_attempt, 0,
            "sweep must not charge an attempt"
        );
    }
}
