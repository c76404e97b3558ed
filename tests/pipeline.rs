//! End-to-end pipeline scenarios: worker pool, handlers and orchestrator
//! chained over a real tempdir project tree.

use std::sync::Arc;
use std::time::Duration;

use lumen_jobs::handlers::{PRIORITY_NORMAL, PRIORITY_REVERT};
use lumen_jobs::maintenance::Maintenance;
use lumen_jobs::{
    EventBus, HandlerContext, HandlerRegistry, JobScope, JobStatus, JobType, ListFilter,
    MediaConfig, NewItem, NewJob, Orchestrator, WorkerPool, WorkerPoolConfig,
};
use lumen_media::{DerivativeKind, LocalProjectStore, MockProcessor, ProjectPaths, ProjectStore};
use lumen_store::{Db, DerivativeStatus};

struct Harness {
    _dir: tempfile::TempDir,
    ctx: HandlerContext,
    pool: WorkerPool,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("db").as_path(), "default")
            .await
            .unwrap();
        let bus = EventBus::new();
        let ctx = HandlerContext::new(
            db.clone(),
            Arc::new(LocalProjectStore::new(dir.path().join("projects"))),
            Arc::new(MockProcessor::default()),
            ProjectPaths::new(dir.path().join("projects"), "default"),
            bus.clone(),
            MediaConfig::default(),
        );
        let orchestrator = Orchestrator::new(
            ctx.repo.clone(),
            ctx.photos.clone(),
            ctx.projects.clone(),
            bus,
            8,
        );
        let pool = WorkerPool::spawn(
            ctx.clone(),
            Arc::new(HandlerRegistry::builtin()),
            orchestrator,
            WorkerPoolConfig {
                total_workers: 2,
                priority_workers: 1,
                claim_poll_interval_ms: 10,
                lane_steal_after_polls: 2,
                ..Default::default()
            },
        );
        Self {
            _dir: dir,
            ctx,
            pool,
        }
    }

    async fn wait_for(&self, job_id: i64, wanted: JobStatus) {
        for _ in 0..600 {
            if self.ctx.repo.get(job_id).await.unwrap().status == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {wanted}");
    }

    /// Wait until a job of `job_type` exists and has completed. Covers the
    /// window between a predecessor's terminal transition and the
    /// orchestrator's successor enqueue.
    async fn wait_for_completed_of_type(&self, job_type: JobType) -> lumen_jobs::JobRecord {
        for _ in 0..600 {
            let jobs = self
                .ctx
                .repo
                .list(&ListFilter {
                    job_type: Some(job_type),
                    ..Default::default()
                })
                .await
                .unwrap();
            if let Some(job) = jobs
                .iter()
                .find(|j| j.status == JobStatus::Completed)
            {
                return job.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no completed {job_type} job appeared");
    }

    /// Wait until no queued or running jobs remain.
    async fn drain(&self) {
        for _ in 0..600 {
            let active = self
                .ctx
                .repo
                .list(&ListFilter {
                    status: Some(JobStatus::Queued),
                    ..Default::default()
                })
                .await
                .unwrap()
                .len()
                + self
                    .ctx
                    .repo
                    .list(&ListFilter {
                        status: Some(JobStatus::Running),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
                    .len();
            if active == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never drained");
    }
}

#[tokio::test]
async fn upload_chain_produces_derivatives() {
    let mut harness = Harness::start().await;
    let ctx = &harness.ctx;

    let project = ctx.projects.create("Inbox").await.unwrap();
    ctx.store
        .ensure_project_dirs("default", &project.folder)
        .await
        .unwrap();
    ctx.store
        .write_file(&ctx.paths.original(&project.folder, "shot.jpg"), b"jpeg")
        .await
        .unwrap();

    let jobs = ctx
        .repo
        .enqueue_with_items(
            NewJob::new(JobType::UploadPostprocess, JobScope::PhotoSet)
                .project(project.id)
                .priority(80),
            vec![NewItem::filename("shot.jpg")],
            false,
        )
        .await
        .unwrap();
    ctx.bus.notify_enqueued();

    harness.wait_for(jobs[0].id, JobStatus::Completed).await;
    let generated = harness
        .wait_for_completed_of_type(JobType::GenerateDerivatives)
        .await;
    harness.drain().await;

    // The orchestrator chained generate_derivatives; the photo converged.
    let photo = ctx
        .photos
        .get_by_basename(project.id, "shot")
        .await
        .unwrap()
        .expect("photo registered by postprocess");
    assert_eq!(photo.thumbnail_status, DerivativeStatus::Generated);
    assert_eq!(photo.preview_status, DerivativeStatus::Generated);
    assert!(ctx
        .store
        .path_exists(&ctx.paths.derivative(&project.folder, DerivativeKind::Thumbnail, "shot"))
        .await);
    assert_eq!(
        generated.payload.get("predecessor_id").and_then(|v| v.as_i64()),
        Some(jobs[0].id)
    );

    harness.pool.shutdown();
}

#[tokio::test]
async fn move_with_copied_derivatives_skips_regeneration() {
    let mut harness = Harness::start().await;
    let ctx = &harness.ctx;

    let source = ctx.projects.create("Source").await.unwrap();
    let dest = ctx.projects.create("Dest").await.unwrap();
    for p in [&source, &dest] {
        ctx.store
            .ensure_project_dirs("default", &p.folder)
            .await
            .unwrap();
    }

    let photo = ctx.photos.upsert_uploaded(source.id, "a.jpg").await.unwrap();
    ctx.photos
        .set_derivative_status(
            photo.id,
            Some(DerivativeStatus::Generated),
            Some(DerivativeStatus::Generated),
        )
        .await
        .unwrap();
    ctx.store
        .write_file(&ctx.paths.original(&source.folder, "a.jpg"), b"jpeg")
        .await
        .unwrap();
    for kind in [DerivativeKind::Thumbnail, DerivativeKind::Preview] {
        ctx.store
            .write_file(&ctx.paths.derivative(&source.folder, kind, "a"), b"deriv")
            .await
            .unwrap();
    }

    let jobs = ctx
        .repo
        .enqueue_with_items(
            NewJob::new(JobType::ImageMove, JobScope::PhotoSet)
                .project(dest.id)
                .priority(80),
            vec![NewItem::filename("a.jpg")],
            false,
        )
        .await
        .unwrap();
    ctx.bus.notify_enqueued();

    harness.wait_for(jobs[0].id, JobStatus::Completed).await;
    // The manifest check on the source is the last link in this chain.
    harness
        .wait_for_completed_of_type(JobType::ManifestCheck)
        .await;
    harness.drain().await;

    // Derivatives traveled: no successor generation job exists, but the
    // source project still got its manifest check.
    let moved_job = ctx.repo.get(jobs[0].id).await.unwrap();
    assert!(!moved_job
        .payload
        .get("need_generate_derivatives")
        .and_then(|v| v.as_bool())
        .unwrap_or(true));
    assert!(ctx
        .repo
        .list(&ListFilter {
            job_type: Some(JobType::GenerateDerivatives),
            ..Default::default()
        })
        .await
        .unwrap()
        .is_empty());

    let checks = ctx
        .repo
        .list(&ListFilter {
            job_type: Some(JobType::ManifestCheck),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].project_id, Some(source.id));

    let photo = ctx.photos.get_by_id(photo.id).await.unwrap();
    assert_eq!(photo.project_id, dest.id);
    assert_eq!(photo.thumbnail_status, DerivativeStatus::Generated);

    harness.pool.shutdown();
}

#[tokio::test]
async fn move_without_derivatives_chains_high_priority_regeneration() {
    let mut harness = Harness::start().await;
    let ctx = &harness.ctx;

    let source = ctx.projects.create("Source").await.unwrap();
    let dest = ctx.projects.create("Dest").await.unwrap();
    for p in [&source, &dest] {
        ctx.store
            .ensure_project_dirs("default", &p.folder)
            .await
            .unwrap();
    }
    let photo = ctx.photos.upsert_uploaded(source.id, "b.jpg").await.unwrap();
    ctx.photos
        .set_derivative_status(
            photo.id,
            Some(DerivativeStatus::Generated),
            Some(DerivativeStatus::Generated),
        )
        .await
        .unwrap();
    ctx.store
        .write_file(&ctx.paths.original(&source.folder, "b.jpg"), b"jpeg")
        .await
        .unwrap();

    let jobs = ctx
        .repo
        .enqueue_with_items(
            NewJob::new(JobType::ImageMove, JobScope::PhotoSet)
                .project(dest.id)
                .priority(80),
            vec![NewItem::filename("b.jpg")],
            false,
        )
        .await
        .unwrap();
    ctx.bus.notify_enqueued();

    harness.wait_for(jobs[0].id, JobStatus::Completed).await;
    let successor = harness
        .wait_for_completed_of_type(JobType::GenerateDerivatives)
        .await;
    harness.drain().await;
    assert!(successor.priority >= 70);

    let photo = ctx.photos.get_by_id(photo.id).await.unwrap();
    assert_eq!(photo.project_id, dest.id);
    assert_eq!(photo.thumbnail_status, DerivativeStatus::Generated);
    assert_eq!(photo.preview_status, DerivativeStatus::Generated);

    harness.pool.shutdown();
}

#[tokio::test]
async fn revert_outruns_commit_and_commit_finds_nothing() {
    // Driven by a single claimer so the priority ordering is observable:
    // commit is enqueued first, revert second at higher priority, and the
    // queue hands the revert out first.
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("db").as_path(), "default")
        .await
        .unwrap();
    let ctx = HandlerContext::new(
        db,
        Arc::new(LocalProjectStore::new(dir.path().join("projects"))),
        Arc::new(MockProcessor::default()),
        ProjectPaths::new(dir.path().join("projects"), "default"),
        EventBus::new(),
        MediaConfig::default(),
    );
    let registry = HandlerRegistry::builtin();

    let project = ctx.projects.create("Race").await.unwrap();
    ctx.store
        .ensure_project_dirs("default", &project.folder)
        .await
        .unwrap();
    let photo = ctx.photos.upsert_uploaded(project.id, "keepme.jpg").await.unwrap();
    ctx.store
        .write_file(&ctx.paths.original(&project.folder, "keepme.jpg"), b"jpeg")
        .await
        .unwrap();
    ctx.photos
        .set_keep_flags(photo.id, Some(false), None)
        .await
        .unwrap();

    let commit = ctx
        .repo
        .enqueue(
            NewJob::new(JobType::CommitChanges, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_NORMAL),
        )
        .await
        .unwrap();
    let revert = ctx
        .repo
        .enqueue(
            NewJob::new(JobType::RevertChanges, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_REVERT),
        )
        .await
        .unwrap();

    let claim = lumen_jobs::ClaimFilter {
        worker_id: "solo".into(),
        ..Default::default()
    };
    let first = ctx.repo.claim_next(&claim).await.unwrap().unwrap();
    assert_eq!(first.id, revert.id);
    registry
        .get(first.job_type)
        .unwrap()
        .run(&first, &ctx)
        .await
        .unwrap();
    ctx.repo.complete(first.id).await.unwrap();

    let second = ctx.repo.claim_next(&claim).await.unwrap().unwrap();
    assert_eq!(second.id, commit.id);
    registry
        .get(second.job_type)
        .unwrap()
        .run(&second, &ctx)
        .await
        .unwrap();
    ctx.repo.complete(second.id).await.unwrap();

    // The photo survived with its file; the commit had zero work.
    let photo = ctx.photos.get_by_id(photo.id).await.unwrap();
    assert!(photo.jpg_available && photo.keep_jpg);
    assert!(ctx
        .store
        .path_exists(&ctx.paths.original(&project.folder, "keepme.jpg"))
        .await);
    assert_eq!(
        ctx.repo.get(commit.id).await.unwrap().progress_total,
        Some(0)
    );
}

#[tokio::test]
async fn sse_subscribers_observe_terminal_convergence() {
    let mut harness = Harness::start().await;
    let ctx = &harness.ctx;
    let mut rx = ctx.bus.subscribe_jobs();

    let project = ctx.projects.create("Events").await.unwrap();
    let job = ctx
        .repo
        .enqueue(
            NewJob::new(JobType::CommitChanges, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_NORMAL),
        )
        .await
        .unwrap();
    ctx.bus.notify_enqueued();
    harness.wait_for(job.id, JobStatus::Completed).await;

    // Regardless of which intermediate events were seen, the stream
    // converges on the completed state for this job.
    let mut saw_completed = false;
    while let Ok(result) =
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
    {
        let Ok(event) = result else { continue };
        let json = serde_json::to_value(&event).unwrap();
        if json["id"] == job.id && json["status"] == "completed" {
            saw_completed = true;
            break;
        }
    }
    assert!(saw_completed, "completed event never arrived");

    harness.pool.shutdown();
}

#[tokio::test]
async fn crashed_worker_recovery_is_fully_automatic() {
    // A job claimed by a "worker" that never heartbeats is swept back into
    // the queue by maintenance and finished by the real pool.
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("db").as_path(), "default")
        .await
        .unwrap();
    let bus = EventBus::new();
    let ctx = HandlerContext::new(
        db.clone(),
        Arc::new(LocalProjectStore::new(dir.path().join("projects"))),
        Arc::new(MockProcessor::default()),
        ProjectPaths::new(dir.path().join("projects"), "default"),
        bus.clone(),
        MediaConfig::default(),
    );

    let job = ctx
        .repo
        .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
        .await
        .unwrap();

    // Phantom claim, then silence.
    ctx.repo
        .claim_next(&lumen_jobs::ClaimFilter {
            worker_id: "phantom".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    sqlx::query("UPDATE jobs SET heartbeat_at = heartbeat_at - 3600 WHERE id = ?")
        .bind(job.id)
        .execute(ctx.repo.db().pool())
        .await
        .unwrap();

    let config = WorkerPoolConfig {
        total_workers: 1,
        priority_workers: 0,
        stale_timeout_secs: 1,
        claim_poll_interval_ms: 10,
        lane_steal_after_polls: 1,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        ctx.repo.clone(),
        ctx.photos.clone(),
        ctx.projects.clone(),
        bus.clone(),
        8,
    );
    let mut maintenance = Maintenance::spawn(
        ctx.repo.clone(),
        bus,
        &config,
        Duration::from_secs(3600),
    );
    let mut pool = WorkerPool::spawn(
        ctx.clone(),
        Arc::new(HandlerRegistry::builtin()),
        orchestrator,
        config,
    );

    let mut completed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if ctx.repo.get(job.id).await.unwrap().status == JobStatus::Completed {
            completed = true;
            break;
        }
    }
    assert!(completed, "stale job never recovered and completed");

    maintenance.shutdown();
    pool.shutdown();
}
