//! Bounded worker pool with two priority lanes.
//!
//! Each worker is an independent tokio task running a claim loop. Priority
//! workers only look at the high lane (priority at or above the threshold).
//! Normal workers prefer the normal lane but, after a configurable number
//! of consecutive empty polls, take a single high-lane job to help drain
//! it; the high lane never drains normal work. Within a worker, handling is
//! single-threaded and cooperative: one job at a time, items strictly
//! sequential, cancellation observed at item boundaries.
//!
//! A heartbeat ticker runs beside the handler so a crashed worker's job
//! goes silent and is requeued by the stale-recovery routine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::JobEvent;
use crate::handlers::{HandlerContext, HandlerError, HandlerRegistry};
use crate::orchestrator::Orchestrator;
use crate::repo::{ClaimFilter, JobsRepository};
use crate::{JobRecord, JobStatus, Result};

/// Enumerated worker pool configuration. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerPoolConfig {
    /// Overall concurrency.
    pub total_workers: usize,
    /// Jobs at or above this priority run in the high lane.
    pub priority_threshold: i64,
    /// Workers pinned to the high lane.
    pub priority_workers: usize,
    pub heartbeat_interval_secs: u64,
    /// A running job silent for longer than this is considered abandoned.
    pub stale_timeout_secs: u64,
    pub default_max_attempts: i64,
    /// Sleep between claim attempts when no work is available.
    pub claim_poll_interval_ms: u64,
    /// Consecutive empty polls before a normal worker takes high-lane work.
    pub lane_steal_after_polls: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            total_workers: 4,
            priority_threshold: crate::DEFAULT_PRIORITY_THRESHOLD,
            priority_workers: 1,
            heartbeat_interval_secs: 10,
            stale_timeout_secs: 60,
            default_max_attempts: 3,
            claim_poll_interval_ms: 250,
            lane_steal_after_polls: 4,
        }
    }
}

impl WorkerPoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn claim_poll_interval(&self) -> Duration {
        Duration::from_millis(self.claim_poll_interval_ms.max(10))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Priority,
    Normal,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured workers. They run until the pool is shut down.
    pub fn spawn(
        ctx: HandlerContext,
        registry: Arc<HandlerRegistry>,
        orchestrator: Orchestrator,
        config: WorkerPoolConfig,
    ) -> Self {
        let total = config.total_workers.max(1);
        let priority = config.priority_workers.min(total);
        let mut handles = Vec::with_capacity(total);

        for n in 0..total {
            let lane = if n < priority {
                Lane::Priority
            } else {
                Lane::Normal
            };
            let worker = Worker {
                id: format!("worker-{}", Uuid::new_v4()),
                lane,
                ctx: ctx.clone(),
                registry: Arc::clone(&registry),
                orchestrator: orchestrator.clone(),
                config: config.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        tracing::info!(
            total,
            priority_workers = priority,
            threshold = config.priority_threshold,
            "worker pool online"
        );
        Self { handles }
    }

    pub fn shutdown(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        self.handles.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: String,
    lane: Lane,
    ctx: HandlerContext,
    registry: Arc<HandlerRegistry>,
    orchestrator: Orchestrator,
    config: WorkerPoolConfig,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = %self.id, lane = ?self.lane, "worker started");
        let mut empty_polls: u32 = 0;
        loop {
            match self.claim(empty_polls).await {
                Ok(Some(job)) => {
                    empty_polls = 0;
                    if let Err(e) = self.process(job).await {
                        // Repository failure mid-job; back off to avoid a
                        // hot loop against a sick database.
                        tracing::error!(worker = %self.id, error = %e, "job processing error");
                        tokio::time::sleep(self.config.claim_poll_interval() * 4).await;
                    }
                }
                Ok(None) => {
                    empty_polls = empty_polls.saturating_add(1);
                    tokio::select! {
                        _ = self.ctx.bus.enqueue_notified() => {}
                        _ = tokio::time::sleep(self.config.claim_poll_interval()) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "claim failed");
                    tokio::time::sleep(self.config.claim_poll_interval() * 4).await;
                }
            }
        }
    }

    async fn claim(&self, empty_polls: u32) -> Result<Option<JobRecord>> {
        let threshold = self.config.priority_threshold;
        match self.lane {
            Lane::Priority => {
                self.ctx
                    .repo
                    .claim_next(&ClaimFilter {
                        worker_id: self.id.clone(),
                        min_priority: Some(threshold),
                        ..Default::default()
                    })
                    .await
            }
            Lane::Normal => {
                let claimed = self
                    .ctx
                    .repo
                    .claim_next(&ClaimFilter {
                        worker_id: self.id.clone(),
                        max_priority: Some(threshold - 1),
                        ..Default::default()
                    })
                    .await?;
                if claimed.is_some() {
                    return Ok(claimed);
                }
                if empty_polls >= self.config.lane_steal_after_polls {
                    // Normal lane is dry; take one high-lane job to help.
                    return self
                        .ctx
                        .repo
                        .claim_next(&ClaimFilter {
                            worker_id: self.id.clone(),
                            ..Default::default()
                        })
                        .await;
                }
                Ok(None)
            }
        }
    }

    async fn process(&self, job: JobRecord) -> Result<()> {
        let repo = &self.ctx.repo;
        tracing::info!(
            worker = %self.id,
            job_id = job.id,
            job_type = %job.job_type,
            priority = job.priority,
            attempts = job.attempts,
            "claimed job"
        );

        if job.max_attempts.is_none() {
            repo.set_default_max_attempts(job.id, self.config.default_max_attempts)
                .await?;
        }

        let folder = self.ctx.project_folder(&job).await;
        self.ctx
            .bus
            .publish_job(JobEvent::for_job(&job, folder.clone()));

        let Some(handler) = self.registry.get(job.job_type) else {
            repo.fail(job.id, "no handler registered for job type").await?;
            self.publish_current(job.id, folder.clone()).await?;
            return Ok(());
        };

        let heartbeat = spawn_heartbeat(
            repo.clone(),
            job.id,
            self.config.heartbeat_interval(),
        );
        let outcome = handler.run(&job, &self.ctx).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                if repo.complete(job.id).await? {
                    let finished = repo.get(job.id).await?;
                    tracing::info!(job_id = job.id, "job completed");
                    self.ctx
                        .bus
                        .publish_job(JobEvent::for_job(&finished, folder));
                    if let Err(e) = self.orchestrator.on_terminal(&finished).await {
                        tracing::error!(job_id = job.id, error = %e, "orchestrator failed");
                    }
                } else {
                    // Canceled out from under the handler; nothing to mark.
                    self.after_cancellation(job.id, folder).await?;
                }
            }
            Err(HandlerError::Canceled) => {
                tracing::info!(job_id = job.id, "job observed cancellation");
                repo.fail_running_items(job.id, "interrupted").await?;
                self.publish_current(job.id, folder).await?;
            }
            Err(HandlerError::Transient(e)) => {
                let message = format!("{e:#}");
                repo.record_error(job.id, &message).await?;
                let attempts = repo.increment_attempts(job.id).await?;
                let max_attempts = repo
                    .get(job.id)
                    .await?
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts);
                if attempts < max_attempts {
                    tracing::warn!(
                        job_id = job.id,
                        attempts,
                        max_attempts,
                        error = %message,
                        "transient failure, requeueing"
                    );
                    repo.requeue(job.id).await?;
                    self.ctx.bus.notify_enqueued();
                } else {
                    tracing::error!(
                        job_id = job.id,
                        attempts,
                        error = %message,
                        "attempts exhausted, failing job"
                    );
                    repo.fail(job.id, &message).await?;
                    let finished = repo.get(job.id).await?;
                    if let Err(e) = self.orchestrator.on_terminal(&finished).await {
                        tracing::error!(job_id = job.id, error = %e, "orchestrator failed");
                    }
                }
                self.publish_current(job.id, folder).await?;
            }
            Err(HandlerError::Fatal(e)) => {
                let message = format!("{e:#}");
                tracing::error!(job_id = job.id, error = %message, "fatal failure");
                repo.fail(job.id, &message).await?;
                let finished = repo.get(job.id).await?;
                self.ctx
                    .bus
                    .publish_job(JobEvent::for_job(&finished, folder));
                if let Err(e) = self.orchestrator.on_terminal(&finished).await {
                    tracing::error!(job_id = job.id, error = %e, "orchestrator failed");
                }
            }
        }
        Ok(())
    }

    async fn after_cancellation(&self, job_id: i64, folder: Option<String>) -> Result<()> {
        if let Some(current) = self.ctx.repo.try_get(job_id).await? {
            if current.status == JobStatus::Canceled {
                self.ctx.repo.fail_running_items(job_id, "interrupted").await?;
            }
            self.ctx.bus.publish_job(JobEvent::for_job(&current, folder));
        }
        Ok(())
    }

    async fn publish_current(&self, job_id: i64, folder: Option<String>) -> Result<()> {
        if let Some(current) = self.ctx.repo.try_get(job_id).await? {
            self.ctx.bus.publish_job(JobEvent::for_job(&current, folder));
        }
        Ok(())
    }
}

fn spawn_heartbeat(repo: JobsRepository, job_id: i64, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The claim already stamped heartbeat_at; skip the immediate tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = repo.heartbeat(job_id).await {
                tracing::warn!(job_id, error = %e, "heartbeat write failed");
            }
        }
    })
}
