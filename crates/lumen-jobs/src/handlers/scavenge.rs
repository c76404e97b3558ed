//! `project_scavenge`: purge a canceled project's folder and rows.

use async_trait::async_trait;

use lumen_store::{ProjectStatus, StoreError};

use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::JobRecord;

pub struct ProjectScavengeHandler;

#[async_trait]
impl JobHandler for ProjectScavengeHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let Some(project_id) = job.project_id else {
            return Err(HandlerError::fatal(anyhow::anyhow!(
                "project_scavenge requires a project"
            )));
        };
        let project = match ctx.projects.get_by_id(project_id).await {
            Ok(p) => p,
            // Already purged; scavenging twice is fine.
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(HandlerError::transient(e)),
        };

        if project.status == ProjectStatus::Active {
            tracing::warn!(
                job_id = job.id,
                project = %project.folder,
                "refusing to scavenge an active project"
            );
            return Ok(());
        }

        let dir = ctx.paths.project_dir(&project.folder);
        if ctx.store.path_exists(&dir).await {
            ctx.store
                .remove_tree(&dir)
                .await
                .map_err(HandlerError::transient)?;
        }

        // Photos cascade; remaining jobs keep a NULL project reference.
        ctx.projects.delete(project.id).await?;
        tracing::info!(job_id = job.id, project = %project.folder, "scavenged project");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerRegistry, MediaConfig};
    use crate::repo::{ClaimFilter, NewJob};
    use crate::{EventBus, JobScope, JobType};
    use lumen_media::{LocalProjectStore, MockProcessor, ProjectPaths, ProjectStore};
    use lumen_store::Db;
    use std::sync::Arc;

    async fn fixture() -> (tempfile::TempDir, HandlerContext) {
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
        (dir, ctx)
    }

    async fn run_scavenge(ctx: &HandlerContext, project_id: i64) {
        ctx.repo
            .enqueue(NewJob::new(JobType::ProjectScavenge, JobScope::Project).project(project_id))
            .await
            .unwrap();
        let job = ctx
            .repo
            .claim_next(&ClaimFilter {
                worker_id: "w".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        HandlerRegistry::builtin()
            .get(JobType::ProjectScavenge)
            .unwrap()
            .run(&job, ctx)
            .await
            .unwrap();
        ctx.repo.complete(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn scavenge_removes_canceled_project_and_cascades() {
        let (_dir, ctx) = fixture().await;
        let project = ctx.projects.create("Doomed").await.unwrap();
        ctx.store
            .ensure_project_dirs("default", &project.folder)
            .await
            .unwrap();
        let photo = ctx
            .photos
            .upsert_uploaded(project.id, "p.jpg")
            .await
            .unwrap();
        ctx.store
            .write_file(&ctx.paths.original(&project.folder, "p.jpg"), b"data")
            .await
            .unwrap();
        ctx.projects
            .set_status(project.id, ProjectStatus::Canceled)
            .await
            .unwrap();

        run_scavenge(&ctx, project.id).await;

        assert!(!ctx
            .store
            .path_exists(&ctx.paths.project_dir(&project.folder))
            .await);
        assert!(matches!(
            ctx.projects.get_by_id(project.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            ctx.photos.get_by_id(photo.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn active_projects_are_left_alone() {
        let (_dir, ctx) = fixture().await;
        let project = ctx.projects.create("Alive").await.unwrap();
        ctx.store
            .ensure_project_dirs("default", &project.folder)
            .await
            .unwrap();

        run_scavenge(&ctx, project.id).await;

        assert!(ctx
            .store
            .path_exists(&ctx.paths.project_dir(&project.folder))
            .await);
        assert!(ctx.projects.get_by_id(project.id).await.is_ok());
    }
}
