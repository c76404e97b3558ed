//! `commit_changes` and `revert_changes`: resolve pending deletions.
//!
//! A pending deletion is an available variant whose keep flag is off.
//! Commit deletes those files and folds the row; revert restores keep flags
//! to mirror availability without touching the filesystem. Both publish a
//! fresh pending-changes snapshot when done, and both converge under
//! repeated invocations.

use async_trait::async_trait;

use lumen_media::DerivativeKind;

use crate::bus::JobEvent;
use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::{pending, JobRecord};

pub struct CommitChangesHandler;

#[async_trait]
impl JobHandler for CommitChangesHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        // Tenant-scope commits only fan out (in the orchestrator); the
        // filesystem work happens in per-project jobs.
        let Some(project_id) = job.project_id else {
            return Ok(());
        };
        let project = ctx
            .projects
            .get_by_id(project_id)
            .await
            .map_err(HandlerError::fatal)?;

        let pending_photos = ctx.photos.photos_with_pending(project.id).await?;
        let total = pending_photos.len() as i64;
        ctx.repo
            .update_progress(job.id, Some(0), Some(total))
            .await?;

        for (index, photo) in pending_photos.into_iter().enumerate() {
            ctx.check_canceled(job.id).await?;

            let clear_jpg = photo.pending_jpg();
            let clear_raw = photo.pending_raw();

            if clear_jpg {
                if let Some(name) = photo.jpg_filename() {
                    ctx.store
                        .remove_file(&ctx.paths.original(&project.folder, &name))
                        .await
                        .map_err(HandlerError::transient)?;
                }
                // The derivative source is gone with the JPEG.
                for kind in [DerivativeKind::Thumbnail, DerivativeKind::Preview] {
                    ctx.store
                        .remove_file(&ctx.paths.derivative(&project.folder, kind, &photo.basename))
                        .await
                        .map_err(HandlerError::transient)?;
                }
            }
            if clear_raw {
                if let Some(name) = photo.raw_filename() {
                    ctx.store
                        .remove_file(&ctx.paths.original(&project.folder, &name))
                        .await
                        .map_err(HandlerError::transient)?;
                }
            }

            let remaining = ctx.photos.apply_commit(photo.id, clear_jpg, clear_raw).await?;
            if remaining.is_none() {
                // Row deleted outright; sweep leftover derivatives.
                for kind in [DerivativeKind::Thumbnail, DerivativeKind::Preview] {
                    ctx.store
                        .remove_file(&ctx.paths.derivative(&project.folder, kind, &photo.basename))
                        .await
                        .map_err(HandlerError::transient)?;
                }
                ctx.bus.publish_job(JobEvent::item_removed(
                    job.id,
                    Some(photo.id),
                    photo.filename.clone(),
                    project.folder.clone(),
                ));
            } else {
                ctx.bus.publish_job(JobEvent::item(
                    job.id,
                    Some(photo.id),
                    photo.filename.clone(),
                    project.folder.clone(),
                    Some("committed".into()),
                ));
            }
            ctx.repo
                .update_progress(job.id, Some(index as i64 + 1), None)
                .await?;
        }

        pending::publish_snapshot(&ctx.photos, &ctx.bus).await?;
        Ok(())
    }
}

pub struct RevertChangesHandler;

#[async_trait]
impl JobHandler for RevertChangesHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let touched = match job.project_id {
            Some(project_id) => {
                let project = ctx
                    .projects
                    .get_by_id(project_id)
                    .await
                    .map_err(HandlerError::fatal)?;
                ctx.photos.reset_keep_to_availability(project.id).await?
            }
            None => {
                // Tenant scope: every project with pending deletions.
                let mut touched = 0;
                for project_id in ctx.photos.project_ids_with_pending().await? {
                    ctx.check_canceled(job.id).await?;
                    touched += ctx.photos.reset_keep_to_availability(project_id).await?;
                }
                touched
            }
        };
        tracing::info!(job_id = job.id, touched, "reverted pending deletions");

        pending::publish_snapshot(&ctx.photos, &ctx.bus).await?;
        Ok(())
    }
}
