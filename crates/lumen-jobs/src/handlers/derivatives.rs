//! `generate_derivatives`: thumbnails and previews for a set of photos.

use async_trait::async_trait;

use lumen_media::{DerivativeKind, DerivativeSpec, MediaError};
use lumen_store::{DerivativeStatus, PhotoRecord, ProjectRecord};

use crate::bus::JobEvent;
use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::{ItemStatus, JobItemRecord, JobRecord};

/// Why an item could not finish: a per-item problem, or a job-level error
/// that should drive the retry policy.
enum ItemError {
    Item(String),
    Job(HandlerError),
}

pub struct GenerateDerivativesHandler;

#[async_trait]
impl JobHandler for GenerateDerivativesHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let Some(project_id) = job.project_id else {
            return Err(HandlerError::fatal(anyhow::anyhow!(
                "generate_derivatives requires a project"
            )));
        };
        let project = ctx
            .projects
            .get_by_id(project_id)
            .await
            .map_err(HandlerError::fatal)?;
        let force = job.payload_bool("force");

        ctx.store
            .ensure_project_dirs(ctx.paths.tenant(), &project.folder)
            .await
            .map_err(HandlerError::transient)?;

        while let Some(item) = ctx.repo.next_pending_item(job.id).await? {
            ctx.check_canceled(job.id).await?;
            ctx.repo
                .update_item_status(item.id, ItemStatus::Running, None)
                .await?;

            match self.process_item(ctx, &project, &item, force).await {
                Ok(message) => {
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Done, message.as_deref())
                        .await?;
                    ctx.bus.publish_job(JobEvent::item(
                        job.id,
                        item.photo_id,
                        item.filename.clone().unwrap_or_default(),
                        project.folder.clone(),
                        message,
                    ));
                }
                Err(ItemError::Item(message)) => {
                    tracing::warn!(job_id = job.id, item_id = item.id, message, "item failed");
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Failed, Some(&message))
                        .await?;
                    ctx.bus.publish_job(JobEvent::item(
                        job.id,
                        item.photo_id,
                        item.filename.clone().unwrap_or_default(),
                        project.folder.clone(),
                        Some(message),
                    ));
                }
                Err(ItemError::Job(err)) => {
                    // Put the item back so the retried job reprocesses it.
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Pending, None)
                        .await?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl GenerateDerivativesHandler {
    async fn resolve_photo(
        &self,
        ctx: &HandlerContext,
        project_id: i64,
        item: &JobItemRecord,
    ) -> Result<Option<PhotoRecord>, HandlerError> {
        if let Some(photo_id) = item.photo_id {
            return Ok(ctx.photos.get_by_id(photo_id).await.ok());
        }
        if let Some(filename) = &item.filename {
            return Ok(ctx.photos.get(project_id, filename).await?);
        }
        Ok(None)
    }

    async fn process_item(
        &self,
        ctx: &HandlerContext,
        project: &ProjectRecord,
        item: &JobItemRecord,
        force: bool,
    ) -> Result<Option<String>, ItemError> {
        let photo = self
            .resolve_photo(ctx, project.id, item)
            .await
            .map_err(ItemError::Job)?;
        let Some(photo) = photo else {
            return Err(ItemError::Item("photo not found".into()));
        };

        let needs_thumbnail = force || photo.thumbnail_status == DerivativeStatus::Pending;
        let needs_preview = force || photo.preview_status == DerivativeStatus::Pending;
        if !needs_thumbnail && !needs_preview {
            // Re-running a completed item is a no-op.
            return Ok(Some("up to date".into()));
        }

        let source_name = photo.jpg_filename().unwrap_or_else(|| photo.filename.clone());
        let source = ctx.paths.original(&project.folder, &source_name);
        if !ctx.store.path_exists(&source).await {
            self.mark(ctx, photo.id, needs_thumbnail, needs_preview, DerivativeStatus::Missing)
                .await
                .map_err(ItemError::Job)?;
            return Ok(Some("source missing".into()));
        }

        let mut specs = Vec::new();
        if needs_thumbnail {
            specs.push(DerivativeSpec {
                kind: DerivativeKind::Thumbnail,
                max_dim: ctx.media.thumbnail_max_dim,
                quality: ctx.media.thumbnail_quality,
                output_path: ctx.paths.derivative(
                    &project.folder,
                    DerivativeKind::Thumbnail,
                    &photo.basename,
                ),
            });
        }
        if needs_preview {
            specs.push(DerivativeSpec {
                kind: DerivativeKind::Preview,
                max_dim: ctx.media.preview_max_dim,
                quality: ctx.media.preview_quality,
                output_path: ctx.paths.derivative(
                    &project.folder,
                    DerivativeKind::Preview,
                    &photo.basename,
                ),
            });
        }

        let outcomes = match ctx.processor.process(&source, &specs).await {
            Ok(outcomes) => outcomes,
            Err(MediaError::NotFound(_)) => {
                self.mark(ctx, photo.id, needs_thumbnail, needs_preview, DerivativeStatus::Missing)
                    .await
                    .map_err(ItemError::Job)?;
                return Ok(Some("source missing".into()));
            }
            Err(MediaError::Unsupported(_)) => {
                self.mark(
                    ctx,
                    photo.id,
                    needs_thumbnail,
                    needs_preview,
                    DerivativeStatus::NotSupported,
                )
                .await
                .map_err(ItemError::Job)?;
                return Ok(Some("not supported".into()));
            }
            // I/O trouble is worth a fresh claim.
            Err(e) => return Err(ItemError::Job(HandlerError::transient(e))),
        };

        let mut thumb = None;
        let mut preview = None;
        for outcome in outcomes {
            let status = match outcome.result {
                Ok(_) => DerivativeStatus::Generated,
                Err(MediaError::Unsupported(_)) => DerivativeStatus::NotSupported,
                Err(MediaError::NotFound(_)) => DerivativeStatus::Missing,
                Err(e) => return Err(ItemError::Job(HandlerError::transient(e))),
            };
            match outcome.kind {
                DerivativeKind::Thumbnail => thumb = Some(status),
                DerivativeKind::Preview => preview = Some(status),
            }
        }
        ctx.photos
            .set_derivative_status(photo.id, thumb, preview)
            .await
            .map_err(|e| ItemError::Job(e.into()))?;
        Ok(None)
    }

    async fn mark(
        &self,
        ctx: &HandlerContext,
        photo_id: i64,
        thumbnail: bool,
        preview: bool,
        status: DerivativeStatus,
    ) -> Result<(), HandlerError> {
        ctx.photos
            .set_derivative_status(
                photo_id,
                thumbnail.then_some(status),
                preview.then_some(status),
            )
            .await?;
        Ok(())
    }
}
