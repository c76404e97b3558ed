//! `image_move`: pull photos from their current projects into the job's
//! destination project.
//!
//! Originals always move; derivatives move when they exist at the source.
//! A derivative that did not accompany the move leaves the destination
//! photo `pending` and flips `need_generate_derivatives` in the payload, so
//! the orchestrator can chain a high-priority generation job.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::json;

use lumen_media::DerivativeKind;
use lumen_store::photos::split_filename;

use crate::bus::JobEvent;
use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::{ItemStatus, JobRecord};

enum ItemError {
    Item(String),
    Job(HandlerError),
}

struct MovedEntry {
    filename: String,
    photo_id: i64,
    source_project_id: i64,
    need_derivatives: bool,
}

pub struct ImageMoveHandler;

#[async_trait]
impl JobHandler for ImageMoveHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let Some(dest_id) = job.project_id else {
            return Err(HandlerError::fatal(anyhow::anyhow!(
                "image_move requires a destination project"
            )));
        };
        let dest = ctx
            .projects
            .get_by_id(dest_id)
            .await
            .map_err(HandlerError::fatal)?;
        ctx.store
            .ensure_project_dirs(ctx.paths.tenant(), &dest.folder)
            .await
            .map_err(HandlerError::transient)?;

        // Resume accumulated outcome across retries.
        let mut moved: Vec<serde_json::Value> = job
            .payload_field("moved")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut source_ids: BTreeSet<i64> = job
            .payload_field("source_project_ids")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        let mut need_generate = job.payload_bool("need_generate_derivatives");

        while let Some(item) = ctx.repo.next_pending_item(job.id).await? {
            ctx.check_canceled(job.id).await?;
            ctx.repo
                .update_item_status(item.id, ItemStatus::Running, None)
                .await?;

            let filename = item.filename.clone().unwrap_or_default();
            match self.move_one(ctx, job, &dest, &filename).await {
                Ok(entry) => {
                    need_generate |= entry.need_derivatives;
                    if entry.source_project_id != dest.id {
                        source_ids.insert(entry.source_project_id);
                    }
                    moved.push(json!({
                        "filename": entry.filename,
                        "photo_id": entry.photo_id,
                        "need_derivatives": entry.need_derivatives,
                    }));
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Done, None)
                        .await?;
                }
                Err(ItemError::Item(message)) => {
                    tracing::warn!(job_id = job.id, filename, message, "move item failed");
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Failed, Some(&message))
                        .await?;
                }
                Err(ItemError::Job(err)) => {
                    ctx.repo
                        .update_item_status(item.id, ItemStatus::Pending, None)
                        .await?;
                    // Persist partial outcome before handing back for retry.
                    self.save_payload(ctx, job, &moved, &source_ids, need_generate)
                        .await?;
                    return Err(err);
                }
            }
        }

        self.save_payload(ctx, job, &moved, &source_ids, need_generate)
            .await?;
        Ok(())
    }
}

impl ImageMoveHandler {
    async fn save_payload(
        &self,
        ctx: &HandlerContext,
        job: &JobRecord,
        moved: &[serde_json::Value],
        source_ids: &BTreeSet<i64>,
        need_generate: bool,
    ) -> Result<(), HandlerError> {
        let mut patch = serde_json::Map::new();
        patch.insert("moved".into(), moved.to_vec().into());
        patch.insert(
            "source_project_ids".into(),
            source_ids.iter().copied().collect::<Vec<i64>>().into(),
        );
        patch.insert("need_generate_derivatives".into(), need_generate.into());
        ctx.repo.merge_payload(job.id, patch).await?;
        Ok(())
    }

    async fn move_one(
        &self,
        ctx: &HandlerContext,
        job: &JobRecord,
        dest: &lumen_store::ProjectRecord,
        filename: &str,
    ) -> Result<MovedEntry, ItemError> {
        if filename.is_empty() {
            return Err(ItemError::Item("item carries no filename".into()));
        }
        let (basename, _) = split_filename(filename);

        // Idempotency: a retried item whose photo already lives at the
        // destination has nothing left to move.
        if let Some(photo) = ctx
            .photos
            .get(dest.id, filename)
            .await
            .map_err(|e| ItemError::Job(e.into()))?
        {
            let need = photo.thumbnail_status == lumen_store::DerivativeStatus::Pending
                || photo.preview_status == lumen_store::DerivativeStatus::Pending;
            return Ok(MovedEntry {
                filename: filename.to_string(),
                photo_id: photo.id,
                source_project_id: dest.id,
                need_derivatives: need && photo.jpg_available,
            });
        }

        let photo = ctx
            .photos
            .find_owner_excluding(&basename, dest.id)
            .await
            .map_err(|e| ItemError::Job(e.into()))?
            .ok_or_else(|| ItemError::Item(format!("no photo owns {filename}")))?;
        let source = ctx
            .projects
            .get_by_id(photo.project_id)
            .await
            .map_err(|_| ItemError::Item("source project is gone".into()))?;

        // Originals first. Destination co-named files are overwritten; the
        // row follows the move below.
        for name in photo.variant_filenames() {
            let from = ctx.paths.original(&source.folder, &name);
            if ctx.store.path_exists(&from).await {
                let to = ctx.paths.original(&dest.folder, &name);
                ctx.store
                    .move_file(&from, &to, true)
                    .await
                    .map_err(|e| ItemError::Job(HandlerError::transient(e)))?;
            }
        }

        // Derivatives travel when present; gaps re-arm generation.
        let mut reset_thumbnail = false;
        let mut reset_preview = false;
        for kind in [DerivativeKind::Thumbnail, DerivativeKind::Preview] {
            let from = ctx.paths.derivative(&source.folder, kind, &photo.basename);
            if ctx.store.path_exists(&from).await {
                let to = ctx.paths.derivative(&dest.folder, kind, &photo.basename);
                ctx.store
                    .move_file(&from, &to, true)
                    .await
                    .map_err(|e| ItemError::Job(HandlerError::transient(e)))?;
            } else if photo.jpg_available {
                match kind {
                    DerivativeKind::Thumbnail => reset_thumbnail = true,
                    DerivativeKind::Preview => reset_preview = true,
                }
            }
        }

        let moved_photo = ctx
            .photos
            .move_to_project(photo.id, dest.id, reset_thumbnail, reset_preview)
            .await
            .map_err(|e| ItemError::Job(e.into()))?;

        ctx.bus.publish_job(JobEvent::item_removed(
            job.id,
            Some(photo.id),
            filename,
            source.folder.clone(),
        ));
        ctx.bus.publish_job(JobEvent::item_moved(
            job.id,
            Some(photo.id),
            filename,
            dest.folder.clone(),
        ));

        Ok(MovedEntry {
            filename: filename.to_string(),
            photo_id: moved_photo.id,
            source_project_id: source.id,
            need_derivatives: reset_thumbnail || reset_preview,
        })
    }
}
