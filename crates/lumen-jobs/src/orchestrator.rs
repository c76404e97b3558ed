//! Pipeline orchestration: successor jobs from terminal outcomes.
//!
//! The orchestrator inspects `{type, status, payload}` of every job that
//! reaches a terminal state and enqueues successors: moves after uploads
//! with conflicts, derivative generation after moves that left gaps,
//! manifest checks on move sources, per-project fan-out of tenant-wide
//! commits. Successor enqueues are keyed on `(predecessor_id, type[,
//! project])` so a retried predecessor cannot double-enqueue its chain.
//!
//! Handlers never call the orchestrator. They receive the [`SuccessorSink`]
//! capability instead, which inverts the dependency.

use serde_json::json;

use lumen_store::{PhotoRepo, ProjectRepo};

use crate::bus::{EventBus, JobEvent};
use crate::handlers::{PRIORITY_HIGH, PRIORITY_NORMAL};
use crate::pending;
use crate::repo::{JobsRepository, NewItem, NewJob};
use crate::{JobRecord, JobScope, JobStatus, JobType, Result};

/// Typed successor-enqueue capability handed to handlers and used by the
/// orchestrator itself.
#[derive(Clone)]
pub struct SuccessorSink {
    repo: JobsRepository,
    bus: EventBus,
}

impl SuccessorSink {
    pub fn new(repo: JobsRepository, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    /// Enqueue a successor derived from `predecessor_id`, at most once.
    /// The predecessor id is stamped into the payload; an existing job with
    /// the same `(predecessor, type, project)` key suppresses the enqueue.
    pub async fn enqueue_once(
        &self,
        predecessor_id: i64,
        mut new: NewJob,
        items: Vec<NewItem>,
    ) -> Result<Option<Vec<JobRecord>>> {
        if self
            .repo
            .exists_successor_scoped(new.job_type, predecessor_id, new.project_id)
            .await?
        {
            tracing::debug!(
                predecessor_id,
                job_type = %new.job_type,
                "successor already enqueued, skipping"
            );
            return Ok(None);
        }

        let mut payload = match new.payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".into(), other);
                map
            }
        };
        payload.insert("predecessor_id".into(), predecessor_id.into());
        new.payload = serde_json::Value::Object(payload);

        let jobs = if items.is_empty() {
            vec![self.repo.enqueue(new).await?]
        } else {
            self.repo.enqueue_with_items(new, items, true).await?
        };
        for job in &jobs {
            self.bus.publish_job(JobEvent::for_job(job, None));
        }
        self.bus.notify_enqueued();
        Ok(Some(jobs))
    }

    /// Plain enqueue with worker wakeup, no dedup. Used for self-scheduled
    /// continuations where each predecessor is unique.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobRecord> {
        let job = self.repo.enqueue(new).await?;
        self.bus.publish_job(JobEvent::for_job(&job, None));
        self.bus.notify_enqueued();
        Ok(job)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    sink: SuccessorSink,
    photos: PhotoRepo,
    projects: ProjectRepo,
    bus: EventBus,
    /// Per-terminal-event fan-out cap; the remainder continues through a
    /// self-scheduled sibling.
    fanout_width: usize,
}

impl Orchestrator {
    pub fn new(
        repo: JobsRepository,
        photos: PhotoRepo,
        projects: ProjectRepo,
        bus: EventBus,
        fanout_width: usize,
    ) -> Self {
        Self {
            sink: SuccessorSink::new(repo, bus.clone()),
            photos,
            projects,
            bus,
            fanout_width: fanout_width.max(1),
        }
    }

    /// Inspect a durably-committed terminal transition and enqueue
    /// successors. Idempotent: every enqueue is content-keyed.
    pub async fn on_terminal(&self, job: &JobRecord) -> Result<()> {
        if !job.status.is_terminal() {
            return Ok(());
        }
        match (job.job_type, job.status) {
            (JobType::ImageMove, JobStatus::Completed) => self.after_image_move(job).await,
            (JobType::UploadPostprocess, JobStatus::Completed) => self.after_upload(job).await,
            (JobType::CommitChanges, JobStatus::Completed) => self.after_commit(job).await,
            _ => Ok(()),
        }
    }

    /// Move finished: regenerate derivatives at the destination when the
    /// move left gaps, and reconcile every source project.
    async fn after_image_move(&self, job: &JobRecord) -> Result<()> {
        if job.payload_bool("need_generate_derivatives") {
            let items: Vec<NewItem> = job
                .payload_field("moved")
                .and_then(|v| v.as_array())
                .map(|moved| {
                    moved
                        .iter()
                        .filter(|m| {
                            m.get("need_derivatives")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false)
                        })
                        .filter_map(|m| {
                            let filename = m.get("filename")?.as_str()?.to_string();
                            Some(NewItem {
                                photo_id: m.get("photo_id").and_then(|v| v.as_i64()),
                                filename: Some(filename),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            if !items.is_empty() {
                let mut new = NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet)
                    .priority(PRIORITY_HIGH);
                if let Some(project_id) = job.project_id {
                    new = new.project(project_id);
                }
                self.sink.enqueue_once(job.id, new, items).await?;
            }
        }

        // Sources always get a manifest check to reconcile leftovers.
        let sources: Vec<i64> = job
            .payload_field("source_project_ids")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        for source_id in sources {
            self.sink
                .enqueue_once(
                    job.id,
                    NewJob::new(JobType::ManifestCheck, JobScope::Project)
                        .project(source_id)
                        .priority(PRIORITY_NORMAL),
                    Vec::new(),
                )
                .await?;
        }
        Ok(())
    }

    /// Upload analyzed: conflicting filenames move into this project at
    /// high priority; the rest get their derivatives generated directly.
    async fn after_upload(&self, job: &JobRecord) -> Result<()> {
        let move_items: Vec<NewItem> = job
            .payload_field("move_filenames")
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(NewItem::filename)
                    .collect()
            })
            .unwrap_or_default();
        if !move_items.is_empty() {
            let mut new =
                NewJob::new(JobType::ImageMove, JobScope::PhotoSet).priority(PRIORITY_HIGH);
            if let Some(project_id) = job.project_id {
                new = new.project(project_id);
            }
            self.sink.enqueue_once(job.id, new, move_items).await?;
        }

        let generate_items: Vec<NewItem> = job
            .payload_field("generate")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|m| {
                        let filename = m.get("filename")?.as_str()?.to_string();
                        Some(NewItem {
                            photo_id: m.get("photo_id").and_then(|v| v.as_i64()),
                            filename: Some(filename),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !generate_items.is_empty() {
            let mut new = NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet)
                .priority(PRIORITY_HIGH);
            if let Some(project_id) = job.project_id {
                new = new.project(project_id);
            }
            self.sink.enqueue_once(job.id, new, generate_items).await?;
        }
        Ok(())
    }

    /// Commit finished: broadcast the converged snapshot, and fan a
    /// tenant-wide commit out into per-project siblings, bounded by the
    /// configured width per tick.
    async fn after_commit(&self, job: &JobRecord) -> Result<()> {
        pending::publish_snapshot(&self.photos, &self.bus).await?;

        if job.scope != JobScope::Tenant {
            return Ok(());
        }

        let pending_projects = self.photos.project_ids_with_pending().await?;
        if pending_projects.is_empty() {
            return Ok(());
        }

        for project_id in pending_projects.iter().take(self.fanout_width) {
            // Confirm the project is still active before fanning out.
            match self.projects.get_by_id(*project_id).await {
                Ok(p) if p.status == lumen_store::ProjectStatus::Active => {}
                _ => continue,
            }
            self.sink
                .enqueue_once(
                    job.id,
                    NewJob::new(JobType::CommitChanges, JobScope::Project)
                        .project(*project_id)
                        .priority(PRIORITY_NORMAL),
                    Vec::new(),
                )
                .await?;
        }

        if pending_projects.len() > self.fanout_width {
            // More projects than one tick covers: continue in a sibling.
            self.sink
                .enqueue(
                    NewJob::new(JobType::CommitChanges, JobScope::Tenant)
                        .priority(PRIORITY_NORMAL)
                        .payload(json!({ "continued_from": job.id })),
                )
                .await?;
        }
        Ok(())
    }
}
