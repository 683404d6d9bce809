//! PostgreSQL storage implementation.
//!
//! Jobs live in a single `jobs` table shared by every queue, keyed by queue
//! name. Claims use `FOR UPDATE SKIP LOCKED` so concurrent daemons never
//! hand the same job to two workers, and the `not_before` column gates
//! redelivery after a backoff.
//!
//! The expected schema (the consuming application owns the migration):
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id            uuid PRIMARY KEY,
//!     queue         text NOT NULL,
//!     state         text NOT NULL,
//!     payload       jsonb NOT NULL,
//!     retry_attempt integer NOT NULL DEFAULT 0,
//!     not_before    timestamptz,
//!     worker_id     uuid,
//!     claimed_at    timestamptz,
//!     completed_at  timestamptz,
//!     failed_at     timestamptz,
//!     error         text,
//!     submitted_at  timestamptz NOT NULL DEFAULT now()
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{CarouselError, Result};
use crate::job::{AnyJob, Claimed, Completed, Failed, Job, JobData, JobId, JobState, Pending, WorkerId};

use super::Storage;

/// PostgreSQL implementation of the Storage trait.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    state: String,
    payload: serde_json::Value,
    retry_attempt: i32,
    not_before: Option<DateTime<Utc>>,
    worker_id: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
}

impl JobRow {
    fn data(&self) -> JobData {
        JobData {
            id: JobId(self.id),
            queue: self.queue.clone(),
            payload: self.payload.clone(),
            submitted_at: self.submitted_at,
        }
    }

    fn into_any(self) -> Result<AnyJob> {
        let data = self.data();
        let retry_attempt = self.retry_attempt as u32;
        match self.state.as_str() {
            "pending" => Ok(AnyJob::Pending(Job {
                state: Pending {
                    retry_attempt,
                    not_before: self.not_before,
                },
                data,
            })),
            "claimed" => Ok(AnyJob::Claimed(Job {
                state: Claimed {
                    worker_id: self.worker_id.unwrap_or_default(),
                    claimed_at: self.claimed_at.unwrap_or(self.submitted_at),
                    retry_attempt,
                },
                data,
            })),
            "completed" => Ok(AnyJob::Completed(Job {
                state: Completed {
                    completed_at: self.completed_at.unwrap_or(self.submitted_at),
                },
                data,
            })),
            "failed" => Ok(AnyJob::Failed(Job {
                state: Failed {
                    error: self.error.unwrap_or_default(),
                    failed_at: self.failed_at.unwrap_or(self.submitted_at),
                    retry_attempt,
                },
                data,
            })),
            other => Err(CarouselError::Other(anyhow::anyhow!(
                "Unknown job state in database: {other}"
            ))),
        }
    }
}

impl Storage for PostgresStorage {
    async fn submit(&self, job: Job<Pending>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, state, payload, retry_attempt, not_before, submitted_at)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6)
            "#,
        )
        .bind(*job.data.id)
        .bind(&job.data.queue)
        .bind(&job.data.payload)
        .bind(job.state.retry_attempt as i32)
        .bind(job.state.not_before)
        .bind(job.data.submitted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<Job<Claimed>>> {
        let now = Utc::now();

        // Atomically claim pending jobs; SKIP LOCKED keeps concurrent
        // daemons from blocking on or double-claiming the same rows.
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET state = 'claimed', worker_id = $1, claimed_at = $2
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE queue = $3
                    AND state = 'pending'
                    AND (not_before IS NULL OR not_before <= $2)
                ORDER BY submitted_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, state, payload, retry_attempt, not_before,
                      worker_id, claimed_at, completed_at, failed_at, error, submitted_at
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let retry_attempt = row.retry_attempt as u32;
                let data = row.data();
                Ok(Job {
                    state: Claimed {
                        worker_id,
                        claimed_at: now,
                        retry_attempt,
                    },
                    data,
                })
            })
            .collect()
    }

    async fn persist<T: JobState + Clone>(&self, job: &Job<T>) -> Result<()>
    where
        AnyJob: From<Job<T>>,
    {
        let any_job = AnyJob::from(job.clone());
        let id = any_job.id();

        let rows_affected = match &any_job {
            AnyJob::Pending(j) => sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'pending',
                    retry_attempt = $2,
                    not_before = $3,
                    worker_id = NULL,
                    claimed_at = NULL
                WHERE id = $1 AND state <> 'completed'
                "#,
            )
            .bind(*id)
            .bind(j.state.retry_attempt as i32)
            .bind(j.state.not_before)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            AnyJob::Claimed(j) => sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'claimed',
                    retry_attempt = $2,
                    worker_id = $3,
                    claimed_at = $4,
                    not_before = NULL
                WHERE id = $1 AND state <> 'completed'
                "#,
            )
            .bind(*id)
            .bind(j.state.retry_attempt as i32)
            .bind(j.state.worker_id)
            .bind(j.state.claimed_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            AnyJob::Completed(j) => sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'completed',
                    completed_at = $2
                WHERE id = $1 AND state <> 'completed'
                "#,
            )
            .bind(*id)
            .bind(j.state.completed_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            AnyJob::Failed(j) => sqlx::query(
                r#"
                UPDATE jobs SET
                    state = 'failed',
                    error = $2,
                    failed_at = $3,
                    retry_attempt = $4
                WHERE id = $1 AND state <> 'completed'
                "#,
            )
            .bind(*id)
            .bind(&j.state.error)
            .bind(j.state.failed_at)
            .bind(j.state.retry_attempt as i32)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };

        if rows_affected == 0 {
            // Either the row is missing or it reached the immutable
            // completed state; look it up to report the right error.
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT state FROM jobs WHERE id = $1")
                    .bind(*id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some((state,)) => Err(CarouselError::InvalidState(
                    id,
                    state,
                    "modifiable state".to_string(),
                )),
                None => Err(CarouselError::JobNotFound(id)),
            };
        }

        Ok(())
    }

    async fn view_pending(&self, queue: &str, limit: usize) -> Result<Vec<Job<Pending>>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, queue, state, payload, retry_attempt, not_before,
                   worker_id, claimed_at, completed_at, failed_at, error, submitted_at
            FROM jobs
            WHERE queue = $1 AND state = 'pending'
            ORDER BY submitted_at ASC
            LIMIT $2
            "#,
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Job {
                state: Pending {
                    retry_attempt: row.retry_attempt as u32,
                    not_before: row.not_before,
                },
                data: row.data(),
            })
            .collect())
    }

    async fn get(&self, ids: Vec<JobId>) -> Result<Vec<Result<AnyJob>>> {
        let raw_ids: Vec<Uuid> = ids.iter().map(|id| **id).collect();

        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, queue, state, payload, retry_attempt, not_before,
                   worker_id, claimed_at, completed_at, failed_at, error, submitted_at
            FROM jobs
            WHERE id = ANY($1)
            "#,
        )
        .bind(&raw_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id = std::collections::HashMap::new();
        for row in rows {
            by_id.insert(row.id, row);
        }

        Ok(ids
            .into_iter()
            .map(|id| match by_id.remove(&*id) {
                Some(row) => row.into_any(),
                None => Err(CarouselError::JobNotFound(id)),
            })
            .collect())
    }

    async fn release_stale(&self, queue: &str, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', worker_id = NULL, claimed_at = NULL, not_before = NULL
            WHERE queue = $1 AND state = 'claimed' AND claimed_at < $2
            "#,
        )
        .bind(queue)
        .bind(claimed_before)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            tracing::warn!(
                queue,
                released,
                "Released stale claimed jobs back to pending"
            );
        }
        Ok(released)
    }
}
