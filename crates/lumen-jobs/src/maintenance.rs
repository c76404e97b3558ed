//! Maintenance loops.
//!
//! Two background routines keep the pipeline healthy:
//!
//! - stale recovery runs every `stale_timeout / 2` and requeues running
//!   jobs whose heartbeat went silent (crashed or wedged workers);
//! - the rotation scheduler periodically enqueues a `hash_rotation` job,
//!   keeping at most one in flight.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bus::{EventBus, JobEvent};
use crate::handlers::PRIORITY_MAINTENANCE;
use crate::pool::WorkerPoolConfig;
use crate::repo::{JobsRepository, NewJob};
use crate::{JobScope, JobType};

/// Default spacing between rotation-job enqueues: 6 hours.
pub const DEFAULT_ROTATION_CHECK_INTERVAL_SECS: u64 = 6 * 60 * 60;

pub struct Maintenance {
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    pub fn spawn(
        repo: JobsRepository,
        bus: EventBus,
        pool_config: &WorkerPoolConfig,
        rotation_check_interval: Duration,
    ) -> Self {
        let handles = vec![
            spawn_stale_recovery(repo.clone(), bus.clone(), pool_config.stale_timeout()),
            spawn_rotation_scheduler(repo, bus, rotation_check_interval),
        ];
        Self { handles }
    }

    pub fn shutdown(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        self.handles.clear();
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_stale_recovery(
    repo: JobsRepository,
    bus: EventBus,
    stale_timeout: Duration,
) -> JoinHandle<()> {
    let pause = stale_timeout / 2;
    let stale_seconds = stale_timeout.as_secs() as i64;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(pause).await;
            match repo.requeue_stale_running(stale_seconds).await {
                Ok(ids) if !ids.is_empty() => {
                    for id in &ids {
                        if let Ok(Some(job)) = repo.try_get(*id).await {
                            bus.publish_job(JobEvent::for_job(&job, None));
                        }
                    }
                    bus.notify_enqueued();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "stale recovery sweep failed"),
            }
        }
    })
}

fn spawn_rotation_scheduler(
    repo: JobsRepository,
    bus: EventBus,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match repo.exists_active_of_type(JobType::HashRotation).await {
                Ok(true) => continue,
                Ok(false) => {
                    let new = NewJob::new(JobType::HashRotation, JobScope::Tenant)
                        .priority(PRIORITY_MAINTENANCE);
                    match repo.enqueue(new).await {
                        Ok(job) => {
                            tracing::debug!(job_id = job.id, "scheduled hash rotation");
                            bus.publish_job(JobEvent::for_job(&job, None));
                            bus.notify_enqueued();
                        }
                        Err(e) => tracing::error!(error = %e, "rotation enqueue failed"),
                    }
                }
                Err(e) => tracing::error!(error = %e, "rotation check failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::ClaimFilter;
    use crate::JobStatus;
    use lumen_store::Db;

    #[tokio::test]
    async fn stale_jobs_are_requeued_by_the_sweeper() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), "default").await.unwrap();
        let repo = JobsRepository::new(db);
        let bus = EventBus::new();

        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.claim_next(&ClaimFilter {
            worker_id: "crashed".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();

        // Freeze the heartbeat far beyond the timeout.
        sqlx::query("UPDATE jobs SET heartbeat_at = heartbeat_at - 3600 WHERE id = ?")
            .bind(job.id)
            .execute(repo.db().pool())
            .await
            .unwrap();

        let config = WorkerPoolConfig {
            stale_timeout_secs: 1,
            ..Default::default()
        };
        let mut maintenance = Maintenance::spawn(
            repo.clone(),
            bus,
            &config,
            Duration::from_secs(3600),
        );

        let mut requeued = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if repo.get(job.id).await.unwrap().status == JobStatus::Queued {
                requeued = true;
                break;
            }
        }
        assert!(requeued, "sweeper never requeued the stale job");
        maintenance.shutdown();
    }

    #[tokio::test]
    async fn rotation_scheduler_keeps_one_job_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), "default").await.unwrap();
        let repo = JobsRepository::new(db);
        let bus = EventBus::new();

        let config = WorkerPoolConfig::default();
        let mut maintenance = Maintenance::spawn(
            repo.clone(),
            bus,
            &config,
            Duration::from_millis(50),
        );

        // Give the scheduler several ticks; dedup keeps it at one job.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let rotations = repo
            .list(&crate::repo::ListFilter {
                job_type: Some(JobType::HashRotation),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rotations.len(), 1);
        assert_eq!(rotations[0].status, JobStatus::Queued);
        maintenance.shutdown();
    }
}
