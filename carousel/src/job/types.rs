//! Core types for the queue system.
//!
//! This module defines the type-safe job lifecycle using the typestate pattern.
//! Each job progresses through distinct states, enforced at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        JobId(id)
    }
}

impl std::ops::Deref for JobId {
    type Target = Uuid;

    fn deref(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a worker process claiming jobs.
pub type WorkerId = Uuid;

/// Marker trait for valid job states.
///
/// This trait enables the typestate pattern, ensuring that operations
/// are only performed on jobs in valid states.
pub trait JobState: Send + Sync {}

/// A job to be processed by a queue daemon.
///
/// Uses the typestate pattern to ensure type-safe state transitions.
/// The generic parameter `T` represents the current state of the job.
#[derive(Debug, Clone)]
pub struct Job<T: JobState> {
    /// The current state of the job.
    pub state: T,
    /// The submitted job data.
    pub data: JobData,
}

/// User-supplied data for a queued job.
///
/// The payload is opaque JSON; the consuming worker deserializes it into
/// whatever message shape its queue carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobData {
    /// The ID with which the job was submitted.
    pub id: JobId,

    /// Name of the queue this job belongs to (e.g. "generation").
    ///
    /// Queues share storage; the name is the demux key daemons claim by.
    pub queue: String,

    /// The job payload as JSON.
    pub payload: serde_json::Value,

    /// When the job was first submitted.
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// Job States
// ============================================================================

/// Job is waiting to be processed.
///
/// This is the initial state for all newly submitted jobs, and the state a
/// failed job returns to when a retry is scheduled.
#[derive(Debug, Clone)]
pub struct Pending {
    /// How many failed attempts preceded this one.
    pub retry_attempt: u32,
    /// Earliest claim time; set by the backoff calculation on retry.
    pub not_before: Option<DateTime<Utc>>,
}

impl JobState for Pending {}

/// Job has been claimed by a daemon and is being worked on.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub retry_attempt: u32,
}

impl JobState for Claimed {}

/// Job completed successfully.
#[derive(Debug, Clone)]
pub struct Completed {
    pub completed_at: DateTime<Utc>,
}

impl JobState for Completed {}

/// Job failed.
///
/// A failed job may transition back to `Pending` via
/// [`Job::<Failed>::retry`](crate::job::transitions) if attempts remain.
#[derive(Debug, Clone)]
pub struct Failed {
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_attempt: u32,
}

impl JobState for Failed {}

// ============================================================================
// Unified Job Representation
// ============================================================================

/// Enum that can hold a job in any state.
///
/// This is used for storage and monitoring queries where jobs must be
/// handled uniformly regardless of their current state.
#[derive(Debug, Clone)]
pub enum AnyJob {
    Pending(Job<Pending>),
    Claimed(Job<Claimed>),
    Completed(Job<Completed>),
    Failed(Job<Failed>),
}

impl AnyJob {
    /// Get the job ID regardless of state.
    pub fn id(&self) -> JobId {
        match self {
            AnyJob::Pending(j) => j.data.id,
            AnyJob::Claimed(j) => j.data.id,
            AnyJob::Completed(j) => j.data.id,
            AnyJob::Failed(j) => j.data.id,
        }
    }

    /// Name of the state, for diagnostics and storage columns.
    pub fn state_name(&self) -> &'static str {
        match self {
            AnyJob::Pending(_) => "pending",
            AnyJob::Claimed(_) => "claimed",
            AnyJob::Completed(_) => "completed",
            AnyJob::Failed(_) => "failed",
        }
    }

    /// Check if this job is in the Pending state.
    pub fn is_pending(&self) -> bool {
        matches!(self, AnyJob::Pending(_))
    }

    /// Check if this job is in a terminal state.
    ///
    /// `Failed` is only weakly terminal: a retry may move it back to
    /// Pending, but storage treats `Completed` as immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyJob::Completed(_) | AnyJob::Failed(_))
    }

    /// Try to extract as a Pending job.
    pub fn as_pending(&self) -> Option<&Job<Pending>> {
        match self {
            AnyJob::Pending(j) => Some(j),
            _ => None,
        }
    }
}

impl From<Job<Pending>> for AnyJob {
    fn from(j: Job<Pending>) -> Self {
        AnyJob::Pending(j)
    }
}

impl From<Job<Claimed>> for AnyJob {
    fn from(j: Job<Claimed>) -> Self {
        AnyJob::Claimed(j)
    }
}

impl From<Job<Completed>> for AnyJob {
    fn from(j: Job<Completed>) -> Self {
        AnyJob::Completed(j)
    }
}

impl From<Job<Failed>> for AnyJob {
    fn from(j: Job<Failed>) -> Self {
        AnyJob::Failed(j)
    }
}
