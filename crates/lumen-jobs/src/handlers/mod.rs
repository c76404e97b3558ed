//! Task handlers: the per-job-type logic.
//!
//! Each handler is a function over `(job, capabilities)`. Capabilities come
//! in through [`HandlerContext`]; successor jobs go out through the typed
//! [`SuccessorSink`](crate::orchestrator::SuccessorSink), so handlers never
//! know about the orchestrator. Handlers are idempotent: re-running a
//! completed item is a no-op, or at worst regenerates a byte-identical
//! artifact.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lumen_media::{ImageProcessor, ProjectPaths, ProjectStore};
use lumen_store::{Db, PhotoRepo, ProjectRepo, PublicHashRepo};

use crate::bus::EventBus;
use crate::orchestrator::SuccessorSink;
use crate::repo::JobsRepository;
use crate::{JobRecord, JobStatus, JobType};

mod commit;
mod derivatives;
mod hash_rotation;
mod image_move;
mod manifest_check;
mod scavenge;
mod upload;

pub use commit::{CommitChangesHandler, RevertChangesHandler};
pub use derivatives::GenerateDerivativesHandler;
pub use hash_rotation::HashRotationHandler;
pub use image_move::ImageMoveHandler;
pub use manifest_check::ManifestCheckHandler;
pub use scavenge::ProjectScavengeHandler;
pub use upload::UploadPostprocessHandler;

/// Priority conventions. At or above the threshold (70) is the high lane.
pub const PRIORITY_HIGH: i64 = 80;
pub const PRIORITY_REVERT: i64 = 75;
pub const PRIORITY_NORMAL: i64 = 50;
pub const PRIORITY_MAINTENANCE: i64 = 30;

/// How a handler run ended, beyond plain success.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth retrying with a fresh claim, up to `max_attempts`.
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    /// Fails the job immediately, regardless of attempts.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),

    /// Cancellation observed at an item boundary. Not an error; the job
    /// keeps its canceled status.
    #[error("canceled")]
    Canceled,
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Fatal(err.into())
    }
}

impl From<lumen_store::StoreError> for HandlerError {
    fn from(err: lumen_store::StoreError) -> Self {
        // Contention and I/O against the store are retryable by default.
        HandlerError::Transient(err.into())
    }
}

impl From<crate::JobError> for HandlerError {
    fn from(err: crate::JobError) -> Self {
        match err {
            crate::JobError::Store(e) => e.into(),
            other => HandlerError::Fatal(other.into()),
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Derivative generation and hash lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MediaConfig {
    pub thumbnail_max_dim: u32,
    pub thumbnail_quality: u8,
    pub preview_max_dim: u32,
    pub preview_quality: u8,
    pub hash_ttl_days: i64,
    pub hash_rotation_days: i64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            thumbnail_max_dim: 320,
            thumbnail_quality: 80,
            preview_max_dim: 1600,
            preview_quality: 85,
            hash_ttl_days: 28,
            hash_rotation_days: 21,
        }
    }
}

impl MediaConfig {
    pub fn hash_ttl_secs(&self) -> i64 {
        self.hash_ttl_days * 86_400
    }

    pub fn hash_rotation_secs(&self) -> i64 {
        self.hash_rotation_days * 86_400
    }
}

/// Everything a handler may touch.
#[derive(Clone)]
pub struct HandlerContext {
    pub repo: JobsRepository,
    pub photos: PhotoRepo,
    pub projects: ProjectRepo,
    pub hashes: PublicHashRepo,
    pub store: Arc<dyn ProjectStore>,
    pub processor: Arc<dyn ImageProcessor>,
    pub paths: ProjectPaths,
    pub bus: EventBus,
    pub successors: SuccessorSink,
    pub media: MediaConfig,
}

impl HandlerContext {
    pub fn new(
        db: Db,
        store: Arc<dyn ProjectStore>,
        processor: Arc<dyn ImageProcessor>,
        paths: ProjectPaths,
        bus: EventBus,
        media: MediaConfig,
    ) -> Self {
        let repo = JobsRepository::new(db.clone());
        Self {
            successors: SuccessorSink::new(repo.clone(), bus.clone()),
            photos: PhotoRepo::new(db.clone()),
            projects: ProjectRepo::new(db.clone()),
            hashes: PublicHashRepo::new(db),
            repo,
            store,
            processor,
            paths,
            bus,
            media,
        }
    }

    /// Cooperative cancellation check, called at item boundaries and before
    /// expensive operations.
    pub async fn check_canceled(&self, job_id: i64) -> HandlerResult {
        match self.repo.try_get(job_id).await? {
            Some(job) if job.status == JobStatus::Canceled => Err(HandlerError::Canceled),
            // A job deleted from under us (project purge) also stops work.
            None => Err(HandlerError::Canceled),
            _ => Ok(()),
        }
    }

    /// The folder slug of the job's project, when it has one.
    pub async fn project_folder(&self, job: &JobRecord) -> Option<String> {
        match job.project_id {
            Some(id) => self.projects.get_by_id(id).await.ok().map(|p| p.folder),
            None => None,
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult;
}

/// Explicit mapping from the closed job-type enum to its handler.
/// Unknown types never get this far; they are rejected at enqueue.
pub struct HandlerRegistry {
    map: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// All eight built-in handlers.
    pub fn builtin() -> Self {
        let mut map: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        map.insert(
            JobType::GenerateDerivatives,
            Arc::new(GenerateDerivativesHandler),
        );
        map.insert(JobType::ImageMove, Arc::new(ImageMoveHandler));
        map.insert(JobType::UploadPostprocess, Arc::new(UploadPostprocessHandler));
        map.insert(JobType::CommitChanges, Arc::new(CommitChangesHandler));
        map.insert(JobType::RevertChanges, Arc::new(RevertChangesHandler));
        map.insert(JobType::ManifestCheck, Arc::new(ManifestCheckHandler));
        map.insert(JobType::ProjectScavenge, Arc::new(ProjectScavengeHandler));
        map.insert(JobType::HashRotation, Arc::new(HashRotationHandler));
        Self { map }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.map.get(&job_type).cloned()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.map.insert(job_type, handler);
    }
}
