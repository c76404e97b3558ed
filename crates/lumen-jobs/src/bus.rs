//! In-process publish/subscribe for job progress and pending-changes
//! snapshots.
//!
//! Fan-out uses broadcast channels: publishers never block on subscriber
//! I/O, and a slow subscriber lags and loses the oldest events while the
//! stream converges to the latest state. Pending-changes snapshots pass
//! through a small coalescer that collapses bursts within a 100 ms window,
//! so a commit touching hundreds of photos produces one snapshot, not
//! hundreds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::{JobRecord, JobStatus, JobType};

/// Per-subscriber buffer capacity; overflow drops the oldest events.
const SUBSCRIBER_BUFFER: usize = 256;

/// Burst window for pending-changes snapshots.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// A job lifecycle event or a free-form item record from a handler.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    Job(JobProgressEvent),
    Item(ItemEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgressEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_done: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_folder: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemEventKind {
    Item,
    ItemMoved,
    ItemRemoved,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemEvent {
    #[serde(rename = "type")]
    pub kind: ItemEventKind,
    pub job_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<i64>,
    pub filename: String,
    pub project_folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: i64,
}

impl JobEvent {
    /// Snapshot a job's current progress for the stream.
    pub fn for_job(job: &JobRecord, project_folder: Option<String>) -> Self {
        JobEvent::Job(JobProgressEvent {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress_done: job.progress_done,
            progress_total: job.progress_total,
            project_folder,
            updated_at: lumen_store::now_ts(),
        })
    }

    pub fn item(
        job_id: i64,
        photo_id: Option<i64>,
        filename: impl Into<String>,
        project_folder: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        JobEvent::Item(ItemEvent {
            kind: ItemEventKind::Item,
            job_id,
            photo_id,
            filename: filename.into(),
            project_folder: project_folder.into(),
            message,
            updated_at: lumen_store::now_ts(),
        })
    }

    pub fn item_moved(
        job_id: i64,
        photo_id: Option<i64>,
        filename: impl Into<String>,
        project_folder: impl Into<String>,
    ) -> Self {
        JobEvent::Item(ItemEvent {
            kind: ItemEventKind::ItemMoved,
            job_id,
            photo_id,
            filename: filename.into(),
            project_folder: project_folder.into(),
            message: None,
            updated_at: lumen_store::now_ts(),
        })
    }

    pub fn item_removed(
        job_id: i64,
        photo_id: Option<i64>,
        filename: impl Into<String>,
        project_folder: impl Into<String>,
    ) -> Self {
        JobEvent::Item(ItemEvent {
            kind: ItemEventKind::ItemRemoved,
            job_id,
            photo_id,
            filename: filename.into(),
            project_folder: project_folder.into(),
            message: None,
            updated_at: lumen_store::now_ts(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingTotals {
    pub total: i64,
    pub jpg: i64,
    pub raw: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectPending {
    pub project_folder: String,
    pub pending_total: i64,
    pub pending_jpg: i64,
    pub pending_raw: i64,
}

/// Full pending-changes state: per-project counts, aggregate totals and the
/// legacy per-project boolean flags older clients still read. Both views
/// must converge to the same UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    pub totals: PendingTotals,
    pub projects: Vec<ProjectPending>,
    pub flags: BTreeMap<String, bool>,
}

impl PendingSnapshot {
    pub fn empty() -> Self {
        Self {
            totals: PendingTotals {
                total: 0,
                jpg: 0,
                raw: 0,
            },
            projects: Vec::new(),
            flags: BTreeMap::new(),
        }
    }

    pub fn from_projects(projects: Vec<ProjectPending>) -> Self {
        let totals = PendingTotals {
            total: projects.iter().map(|p| p.pending_total).sum(),
            jpg: projects.iter().map(|p| p.pending_jpg).sum(),
            raw: projects.iter().map(|p| p.pending_raw).sum(),
        };
        let flags = projects
            .iter()
            .map(|p| (p.project_folder.clone(), p.pending_total > 0))
            .collect();
        Self {
            totals,
            projects,
            flags,
        }
    }
}

/// The process-local event bus.
#[derive(Clone)]
pub struct EventBus {
    jobs_tx: broadcast::Sender<JobEvent>,
    pending_tx: broadcast::Sender<PendingSnapshot>,
    pending_in: mpsc::Sender<PendingSnapshot>,
    enqueue_notify: Arc<Notify>,
}

impl EventBus {
    pub fn new() -> Self {
        let (jobs_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let (pending_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let (pending_in, pending_rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        tokio::spawn(coalesce_pending(
            pending_rx,
            pending_tx.clone(),
            COALESCE_WINDOW,
        ));

        Self {
            jobs_tx,
            pending_tx,
            pending_in,
            enqueue_notify: Arc::new(Notify::new()),
        }
    }

    /// Publish a job event. No subscribers is fine.
    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.jobs_tx.send(event);
    }

    /// Publish a pending-changes snapshot through the coalescer. A full
    /// coalescer input drops this snapshot; a later one supersedes it.
    pub fn publish_pending(&self, snapshot: PendingSnapshot) {
        let _ = self.pending_in.try_send(snapshot);
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs_tx.subscribe()
    }

    pub fn subscribe_pending(&self) -> broadcast::Receiver<PendingSnapshot> {
        self.pending_tx.subscribe()
    }

    /// Wake idle workers: a job was enqueued.
    pub fn notify_enqueued(&self) {
        self.enqueue_notify.notify_waiters();
    }

    /// Resolves on the next enqueue signal.
    pub async fn enqueue_notified(&self) {
        self.enqueue_notify.notified().await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse snapshot bursts: after the first snapshot arrives, keep
/// swallowing newer ones until the window closes, then broadcast the latest.
async fn coalesce_pending(
    mut rx: mpsc::Receiver<PendingSnapshot>,
    tx: broadcast::Sender<PendingSnapshot>,
    window: Duration,
) {
    while let Some(mut latest) = rx.recv().await {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(newer)) => latest = newer,
                Ok(None) => {
                    let _ = tx.send(latest);
                    return;
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(latest);
    }
}
