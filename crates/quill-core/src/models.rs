//! Job data model shared between the registry and its callers.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::taxonomy::ClassifiedError;
use crate::uuid_utils::new_v7;

// =============================================================================
// JOB IDENTITY
// =============================================================================

/// Opaque job identifier.
///
/// Callers may supply their own (e.g. `"summary:note-1"`) or generate a
/// time-ordered UUIDv7 with [`JobId::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh UUIDv7-backed id.
    pub fn generate() -> Self {
        Self(new_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Category of AI operation. Bookkeeping only; never changes behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Generate an AI summary of a note
    Summary,
    /// Generate AI tags for a note
    Tags,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Summary => "summary",
            JobKind::Tags => "tags",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    /// Statuses that can never leave their state.
    ///
    /// `Failed` is not listed: it stays retryable while the job's retry
    /// budget and error allow it. See [`Job::is_terminal`].
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one in-flight or recently finished AI operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Entity being processed (note id).
    pub subject_id: String,
    pub status: JobStatus,
    /// Last reported progress, 0-100.
    pub progress: u8,
    pub message: Option<String>,
    pub error: Option<ClassifiedError>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// True if `retry_job` may move this job back to `running`.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed
            && self.retry_count < self.max_retries
            && self.error.as_ref().map_or(true, |e| e.retryable)
    }

    /// True once nothing can move the job out of its current status.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Failed => !self.can_retry(),
            status => status.is_final(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

/// Status change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    pub retry_count: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobStatusUpdate {
    /// Build an update reflecting the job's current state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: Some(job.progress),
            message: job.message.clone(),
            error: job.error.clone(),
            retry_count: job.retry_count,
            occurred_at: Utc::now(),
        }
    }

    /// True if this update reports a status the job can never leave.
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}
