//! Pending-changes snapshot computation.
//!
//! The snapshot is always derived from the database, never from in-memory
//! deltas, so every publication is idempotent and subscribers that missed
//! intermediate states still converge.

use lumen_store::PhotoRepo;

use crate::bus::{EventBus, PendingSnapshot, ProjectPending};
use crate::Result;

/// Compute the current snapshot across all active projects.
pub async fn compute_snapshot(photos: &PhotoRepo) -> Result<PendingSnapshot> {
    let rows = photos.pending_counts().await?;
    let projects = rows
        .into_iter()
        .map(|row| ProjectPending {
            project_folder: row.project_folder,
            pending_total: row.pending_total,
            pending_jpg: row.pending_jpg,
            pending_raw: row.pending_raw,
        })
        .collect();
    Ok(PendingSnapshot::from_projects(projects))
}

/// Compute and publish in one step. Used by handlers after mutations that
/// change pending state.
pub async fn publish_snapshot(photos: &PhotoRepo, bus: &EventBus) -> Result<PendingSnapshot> {
    let snapshot = compute_snapshot(photos).await?;
    bus.publish_pending(snapshot.clone());
    Ok(snapshot)
}
