//! Route handlers.

use lumen_store::ProjectRecord;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub mod jobs;
pub mod photos;
pub mod projects;

/// Resolve a project by folder slug, mapping absence to 404. Canceled
/// projects are treated as gone for the API surface.
pub(crate) async fn project_or_404(state: &AppState, folder: &str) -> ApiResult<ProjectRecord> {
    match state.projects.get_by_folder(folder).await? {
        Some(project) if project.status == lumen_store::ProjectStatus::Active => Ok(project),
        _ => Err(ApiError::NotFound(format!("project {folder}"))),
    }
}
