//! `upload_postprocess`: register freshly uploaded originals.
//!
//! The upload endpoint writes files into the project folder and enqueues
//! this job with one item per filename. The handler creates or merges photo
//! rows, spots cross-project conflicts (a basename already owned by another
//! project) and records in the payload what the orchestrator should chain:
//! an `image_move` for the conflicts, `generate_derivatives` for the rest.

use async_trait::async_trait;
use serde_json::json;

use lumen_store::photos::split_filename;
use lumen_store::DerivativeStatus;

use crate::bus::JobEvent;
use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::{ItemStatus, JobRecord};

pub struct UploadPostprocessHandler;

#[async_trait]
impl JobHandler for UploadPostprocessHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let Some(project_id) = job.project_id else {
            return Err(HandlerError::fatal(anyhow::anyhow!(
                "upload_postprocess requires a project"
            )));
        };
        let project = ctx
            .projects
            .get_by_id(project_id)
            .await
            .map_err(HandlerError::fatal)?;

        let mut move_filenames: Vec<String> = job
            .payload_field("move_filenames")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let mut generate: Vec<serde_json::Value> = job
            .payload_field("generate")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        while let Some(item) = ctx.repo.next_pending_item(job.id).await? {
            ctx.check_canceled(job.id).await?;
            ctx.repo
                .update_item_status(item.id, ItemStatus::Running, None)
                .await?;

            let Some(filename) = item.filename.clone() else {
                ctx.repo
                    .update_item_status(item.id, ItemStatus::Failed, Some("item carries no filename"))
                    .await?;
                continue;
            };
            let (basename, _) = split_filename(&filename);

            // A basename owned elsewhere means this upload belongs to that
            // photo; schedule a move instead of forking the photo.
            let owned_here = ctx
                .photos
                .get_by_basename(project.id, &basename)
                .await?
                .is_some();
            let owner_elsewhere = ctx
                .photos
                .find_owner_excluding(&basename, project.id)
                .await?;

            let message = if !owned_here && owner_elsewhere.is_some() {
                if !move_filenames.contains(&filename) {
                    move_filenames.push(filename.clone());
                }
                ctx.repo
                    .update_item_status(item.id, ItemStatus::Done, Some("scheduled move"))
                    .await?;
                Some("scheduled move".to_string())
            } else {
                let photo = ctx.photos.upsert_uploaded(project.id, &filename).await?;
                if photo.jpg_available
                    && (photo.thumbnail_status == DerivativeStatus::Pending
                        || photo.preview_status == DerivativeStatus::Pending)
                    && !generate
                        .iter()
                        .any(|g| g.get("photo_id").and_then(|v| v.as_i64()) == Some(photo.id))
                {
                    generate.push(json!({
                        "photo_id": photo.id,
                        "filename": photo.filename,
                    }));
                }
                ctx.repo
                    .update_item_status(item.id, ItemStatus::Done, Some("analyzed"))
                    .await?;
                Some("analyzed".to_string())
            };

            ctx.bus.publish_job(JobEvent::item(
                job.id,
                item.photo_id,
                filename,
                project.folder.clone(),
                message,
            ));
        }

        let mut patch = serde_json::Map::new();
        patch.insert("move_filenames".into(), move_filenames.into());
        patch.insert("generate".into(), generate.into());
        ctx.repo.merge_payload(job.id, patch).await?;
        Ok(())
    }
}
