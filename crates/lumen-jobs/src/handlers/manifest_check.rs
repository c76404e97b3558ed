//! `manifest_check`: reconcile a project's on-disk files with its rows.
//!
//! Disk-only basename groups get rows inserted; rows whose files vanished
//! lose their availability (and their row, when nothing remains). Large
//! folders self-schedule: each run reconciles a bounded slice of groups and
//! enqueues a sibling for the rest.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;

use lumen_media::MANIFEST_FILE;
use lumen_store::photos::{classify_ext, split_filename, VariantClass};
use lumen_store::StoreError;

use crate::handlers::{HandlerContext, HandlerError, HandlerResult, JobHandler};
use crate::repo::NewJob;
use crate::{pending, JobRecord, JobScope, JobType, MAX_ITEMS_PER_JOB};

#[derive(Default)]
struct GroupExts {
    jpg: Option<String>,
    raw: Option<String>,
    other: Option<String>,
}

pub struct ManifestCheckHandler;

#[async_trait]
impl JobHandler for ManifestCheckHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let Some(project_id) = job.project_id else {
            return Err(HandlerError::fatal(anyhow::anyhow!(
                "manifest_check requires a project"
            )));
        };
        let project = match ctx.projects.get_by_id(project_id).await {
            Ok(p) => p,
            // Scavenged since enqueue: nothing left to reconcile.
            Err(StoreError::NotFound(_)) => {
                tracing::info!(job_id = job.id, project_id, "project gone, skipping check");
                return Ok(());
            }
            Err(e) => return Err(HandlerError::transient(e)),
        };

        let dir = ctx.paths.project_dir(&project.folder);
        let files = ctx
            .store
            .list_files(&dir)
            .await
            .map_err(HandlerError::transient)?;

        // Group files by basename; one extension per variant class, first
        // in sorted order wins. Hidden files and the manifest are not
        // photos.
        let mut groups: BTreeMap<String, GroupExts> = BTreeMap::new();
        for name in files {
            if name == MANIFEST_FILE || name.starts_with('.') {
                continue;
            }
            let (basename, ext) = split_filename(&name);
            if ext.is_empty() {
                continue;
            }
            let entry = groups.entry(basename).or_default();
            match classify_ext(&ext) {
                VariantClass::Jpeg => entry.jpg.get_or_insert(ext),
                VariantClass::Raw => entry.raw.get_or_insert(ext),
                VariantClass::Other => entry.other.get_or_insert(ext),
            };
        }

        // Deterministic order even for case-colliding names: sort by the
        // lowercased stem, exact stem breaking ties.
        let mut ordered: Vec<(String, GroupExts)> = groups.into_iter().collect();
        ordered.sort_by(|(a, _), (b, _)| {
            (a.to_lowercase(), a.as_str()).cmp(&(b.to_lowercase(), b.as_str()))
        });

        let offset = job
            .payload_field("offset")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as usize;
        let end = (offset + MAX_ITEMS_PER_JOB).min(ordered.len());
        let has_more = end < ordered.len();

        let mut inserted = 0i64;
        let mut updated = 0i64;
        let mut removed = 0i64;

        for (basename, exts) in &ordered[offset.min(ordered.len())..end] {
            ctx.check_canceled(job.id).await?;
            match ctx
                .photos
                .reconcile_variants(
                    project.id,
                    basename,
                    exts.jpg.as_deref(),
                    exts.raw.as_deref(),
                    exts.other.as_deref(),
                )
                .await?
            {
                Some((_, true)) => inserted += 1,
                Some((_, false)) => updated += 1,
                None => removed += 1,
            }
        }

        if has_more {
            // Continue in a sibling chunk instead of overstaying.
            ctx.successors
                .enqueue_once(
                    job.id,
                    NewJob::new(JobType::ManifestCheck, JobScope::Project)
                        .project(project.id)
                        .priority(job.priority)
                        .payload(json!({ "offset": end as i64 })),
                    Vec::new(),
                )
                .await?;
        } else {
            // Final chunk: rows whose files are gone entirely.
            let disk_basenames: std::collections::HashSet<&str> =
                ordered.iter().map(|(b, _)| b.as_str()).collect();
            for photo in ctx.photos.list_project(project.id).await? {
                ctx.check_canceled(job.id).await?;
                if !disk_basenames.contains(photo.basename.as_str()) {
                    ctx.photos
                        .reconcile_variants(project.id, &photo.basename, None, None, None)
                        .await?;
                    removed += 1;
                }
            }
            ctx.projects.bump_manifest_version(project.id).await?;
        }

        let mut patch = serde_json::Map::new();
        patch.insert("scanned".into(), (ordered.len() as i64).into());
        patch.insert("inserted".into(), inserted.into());
        patch.insert("updated".into(), updated.into());
        patch.insert("removed".into(), removed.into());
        ctx.repo.merge_payload(job.id, patch).await?;

        tracing::info!(
            job_id = job.id,
            project = %project.folder,
            inserted,
            updated,
            removed,
            "manifest reconciled"
        );
        pending::publish_snapshot(&ctx.photos, &ctx.bus).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerRegistry, MediaConfig};
    use crate::repo::ClaimFilter;
    use crate::EventBus;
    use lumen_media::{LocalProjectStore, MockProcessor, ProjectPaths, ProjectStore};
    use lumen_store::{Db, DerivativeStatus, ProjectRecord};
    use std::sync::Arc;

    async fn fixture() -> (tempfile::TempDir, HandlerContext, ProjectRecord) {
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
        let project = ctx.projects.create("Trip").await.unwrap();
        ctx.store
            .ensure_project_dirs("default", &project.folder)
            .await
            .unwrap();
        (dir, ctx, project)
    }

    async fn run_check(ctx: &HandlerContext, project_id: i64) -> JobRecord {
        ctx.repo
            .enqueue(NewJob::new(JobType::ManifestCheck, JobScope::Project).project(project_id))
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
            .get(JobType::ManifestCheck)
            .unwrap()
            .run(&job, ctx)
            .await
            .unwrap();
        ctx.repo.complete(job.id).await.unwrap();
        ctx.repo.get(job.id).await.unwrap()
    }

    #[tokio::test]
    async fn inserts_rows_for_disk_only_files() {
        let (_dir, ctx, project) = fixture().await;
        for name in ["new.jpg", "new.arw", "lone.dng", "notes.txt"] {
            ctx.store
                .write_file(&ctx.paths.original(&project.folder, name), b"data")
                .await
                .unwrap();
        }

        let job = run_check(&ctx, project.id).await;
        assert_eq!(job.payload_field("inserted").unwrap().as_i64(), Some(3));

        let merged = ctx
            .photos
            .get_by_basename(project.id, "new")
            .await
            .unwrap()
            .unwrap();
        assert!(merged.jpg_available && merged.raw_available);

        let lone = ctx
            .photos
            .get_by_basename(project.id, "lone")
            .await
            .unwrap()
            .unwrap();
        assert!(lone.raw_available && !lone.jpg_available);

        let project_row = ctx.projects.get_by_id(project.id).await.unwrap();
        assert_eq!(project_row.manifest_version, 2);
    }

    #[tokio::test]
    async fn marks_and_removes_row_only_photos() {
        let (_dir, ctx, project) = fixture().await;
        ctx.photos.upsert_uploaded(project.id, "gone.jpg").await.unwrap();
        ctx.photos.upsert_uploaded(project.id, "half.arw").await.unwrap();
        let half = ctx.photos.upsert_uploaded(project.id, "half.jpg").await.unwrap();
        // Only the raw half survives on disk.
        ctx.store
            .write_file(&ctx.paths.original(&project.folder, "half.arw"), b"raw")
            .await
            .unwrap();

        let job = run_check(&ctx, project.id).await;

        // gone.* had no files at all: row deleted.
        assert!(ctx
            .photos
            .get_by_basename(project.id, "gone")
            .await
            .unwrap()
            .is_none());
        assert_eq!(job.payload_field("removed").unwrap().as_i64(), Some(1));

        // half lost its jpg: availability follows disk, derivatives missing.
        let half = ctx.photos.get_by_id(half.id).await.unwrap();
        assert!(!half.jpg_available && half.raw_available);
        assert_eq!(half.thumbnail_status, DerivativeStatus::Missing);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (_dir, ctx, project) = fixture().await;
        ctx.store
            .write_file(&ctx.paths.original(&project.folder, "a.jpg"), b"data")
            .await
            .unwrap();

        let first = run_check(&ctx, project.id).await;
        assert_eq!(first.payload_field("inserted").unwrap().as_i64(), Some(1));

        let second = run_check(&ctx, project.id).await;
        assert_eq!(second.payload_field("inserted").unwrap().as_i64(), Some(0));
        assert_eq!(second.payload_field("updated").unwrap().as_i64(), Some(1));
        assert_eq!(second.payload_field("removed").unwrap().as_i64(), Some(0));
    }

    #[tokio::test]
    async fn case_colliding_basenames_reconcile_deterministically() {
        let (_dir, ctx, project) = fixture().await;
        ctx.store
            .write_file(&ctx.paths.original(&project.folder, "IMG_1.jpg"), b"a")
            .await
            .unwrap();
        ctx.store
            .write_file(&ctx.paths.original(&project.folder, "img_1.jpg"), b"b")
            .await
            .unwrap();

        let job = run_check(&ctx, project.id).await;
        // Case-sensitive stems are distinct photos, in stable order.
        assert_eq!(job.payload_field("inserted").unwrap().as_i64(), Some(2));
        assert!(ctx
            .photos
            .get_by_basename(project.id, "IMG_1")
            .await
            .unwrap()
            .is_some());
        assert!(ctx
            .photos
            .get_by_basename(project.id, "img_1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn project_deleted_after_claim_is_a_clean_noop() {
        let (_dir, ctx, project) = fixture().await;
        ctx.repo
            .enqueue(NewJob::new(JobType::ManifestCheck, JobScope::Project).project(project.id))
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
        // Project purged between claim and run.
        ctx.projects.delete(project.id).await.unwrap();

        HandlerRegistry::builtin()
            .get(JobType::ManifestCheck)
            .unwrap()
            .run(&job, &ctx)
            .await
            .unwrap();
    }
}
