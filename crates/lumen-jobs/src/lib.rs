//! The durable asynchronous job pipeline at the heart of Lumen.
//!
//! Every non-trivial side-effecting operation runs through here: derivative
//! generation, cross-project moves, commit/revert of pending deletions,
//! manifest reconciliation, project scavenging and public-hash rotation.
//! Jobs and their per-item subtasks are rows in SQLite, so every unit of
//! work survives a crash; a bounded pool of workers claims jobs in two
//! priority lanes, heartbeats while running, retries transient failures and
//! publishes progress to SSE subscribers through an in-process bus.
//!
//! Persistence is the synchronization primitive: workers coordinate only
//! through the jobs table, never through shared memory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bus;
pub mod handlers;
pub mod maintenance;
pub mod orchestrator;
pub mod pending;
pub mod pool;
pub mod repo;

pub use bus::{EventBus, ItemEventKind, JobEvent, PendingSnapshot};
pub use handlers::{HandlerContext, HandlerError, HandlerRegistry, JobHandler, MediaConfig};
pub use orchestrator::{Orchestrator, SuccessorSink};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use repo::{ClaimFilter, ItemsSummary, JobsRepository, ListFilter, NewItem, NewJob};

/// Jobs at or above this priority run in the high lane by default.
pub const DEFAULT_PRIORITY_THRESHOLD: i64 = 70;

/// Hard cap on items per job; larger batches are chunked into siblings.
pub const MAX_ITEMS_PER_JOB: usize = 2000;

/// Persisted error messages are truncated to this many characters.
pub const ERROR_MESSAGE_MAX: usize = 1000;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job type: {0}")]
    UnknownType(String),

    #[error("batch of {got} items exceeds the {max} item cap")]
    BatchTooLarge { got: usize, max: usize },

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("invalid job: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] lumen_store::StoreError),
}

/// The closed set of job types. Unknown types are rejected at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    GenerateDerivatives,
    ImageMove,
    UploadPostprocess,
    CommitChanges,
    RevertChanges,
    ManifestCheck,
    ProjectScavenge,
    HashRotation,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::GenerateDerivatives,
        JobType::ImageMove,
        JobType::UploadPostprocess,
        JobType::CommitChanges,
        JobType::RevertChanges,
        JobType::ManifestCheck,
        JobType::ProjectScavenge,
        JobType::HashRotation,
    ];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::GenerateDerivatives => "generate_derivatives",
            JobType::ImageMove => "image_move",
            JobType::UploadPostprocess => "upload_postprocess",
            JobType::CommitChanges => "commit_changes",
            JobType::RevertChanges => "revert_changes",
            JobType::ManifestCheck => "manifest_check",
            JobType::ProjectScavenge => "project_scavenge",
            JobType::HashRotation => "hash_rotation",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate_derivatives" => Ok(JobType::GenerateDerivatives),
            "image_move" => Ok(JobType::ImageMove),
            "upload_postprocess" => Ok(JobType::UploadPostprocess),
            "commit_changes" => Ok(JobType::CommitChanges),
            "revert_changes" => Ok(JobType::RevertChanges),
            "manifest_check" => Ok(JobType::ManifestCheck),
            "project_scavenge" => Ok(JobType::ProjectScavenge),
            "hash_rotation" => Ok(JobType::HashRotation),
            _ => Err(JobError::UnknownType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            _ => Err(JobError::Invalid(format!("unknown job status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobScope {
    Project,
    PhotoSet,
    Tenant,
}

impl fmt::Display for JobScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobScope::Project => "project",
            JobScope::PhotoSet => "photo_set",
            JobScope::Tenant => "tenant",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobScope {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(JobScope::Project),
            "photo_set" => Ok(JobScope::PhotoSet),
            "tenant" => Ok(JobScope::Tenant),
            _ => Err(JobError::Invalid(format!("unknown job scope: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ItemStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "done" => Ok(ItemStatus::Done),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(JobError::Invalid(format!("unknown item status: {s}"))),
        }
    }
}

/// One persisted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub tenant_id: String,
    pub project_id: Option<i64>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    pub scope: JobScope,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub worker_id: Option<String>,
    pub progress_done: i64,
    pub progress_total: Option<i64>,
    pub attempts: i64,
    pub max_attempts: Option<i64>,
    pub last_error_at: Option<i64>,
    pub error_message: Option<String>,
    pub payload: serde_json::Value,
}

impl JobRecord {
    /// Read a payload field, if the payload is an object carrying it.
    pub fn payload_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload_field(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

/// One persisted per-job subtask.
#[derive(Debug, Clone, Serialize)]
pub struct JobItemRecord {
    pub id: i64,
    pub job_id: i64,
    pub photo_id: Option<i64>,
    pub filename: Option<String>,
    pub status: ItemStatus,
    pub message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trips() {
        for t in JobType::ALL {
            assert_eq!(t.to_string().parse::<JobType>().unwrap(), t);
        }
        assert!(matches!(
            "reticulate_splines".parse::<JobType>(),
            Err(JobError::UnknownType(_))
        ));
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn serde_names_match_wire_format() {
        assert_eq!(
            serde_json::to_string(&JobType::GenerateDerivatives).unwrap(),
            "\"generate_derivatives\""
        );
        assert_eq!(serde_json::to_string(&JobScope::PhotoSet).unwrap(), "\"photo_set\"");
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
    }
}
