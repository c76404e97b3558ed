//! `hash_rotation`: roll public access hashes before they lapse.
//!
//! Rotates every hash that is already expired or older than the rotation
//! horizon, and issues hashes to public photos that somehow lack one.
//! Private photos are never touched here; their hashes die when visibility
//! flips.

use async_trait::async_trait;
use chrono::Utc;

use crate::handlers::{HandlerContext, HandlerResult, JobHandler};
use crate::JobRecord;

pub struct HashRotationHandler;

#[async_trait]
impl JobHandler for HashRotationHandler {
    async fn run(&self, job: &JobRecord, ctx: &HandlerContext) -> HandlerResult {
        let now = Utc::now();
        let ttl = ctx.media.hash_ttl_secs();
        let horizon = ctx.media.hash_rotation_secs();

        let candidates = ctx.hashes.rotation_candidates(now, horizon).await?;
        let mut rotated = 0i64;
        for candidate in candidates {
            ctx.check_canceled(job.id).await?;
            ctx.hashes.rotate(candidate.photo_id, now, ttl).await?;
            rotated += 1;
        }

        let orphans = ctx.hashes.public_photos_without_hash().await?;
        let mut ensured = 0i64;
        for photo_id in orphans {
            ctx.check_canceled(job.id).await?;
            ctx.hashes.ensure(photo_id, now, ttl).await?;
            ensured += 1;
        }

        let mut patch = serde_json::Map::new();
        patch.insert("rotated".into(), rotated.into());
        patch.insert("ensured".into(), ensured.into());
        ctx.repo.merge_payload(job.id, patch).await?;

        if rotated > 0 || ensured > 0 {
            tracing::info!(job_id = job.id, rotated, ensured, "rotated public hashes");
        }
        Ok(())
    }
}
