//! Project endpoints: create, list, delete, commit/revert submission.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use lumen_jobs::handlers::{PRIORITY_NORMAL, PRIORITY_REVERT};
use lumen_jobs::{JobRecord, JobScope, JobType, NewJob};
use lumen_store::{ProjectRecord, ProjectStatus};

use crate::error::{ApiError, ApiResult};
use crate::routes::project_or_404;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

/// Create a project: row, folder tree and manifest, synchronously.
pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectRecord>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("project name is required".into()));
    }

    let project = state.projects.create(name).await?;
    state
        .store
        .ensure_project_dirs(state.paths.tenant(), &project.folder)
        .await?;
    let manifest = serde_json::json!({
        "folder": project.folder,
        "name": project.name,
        "version": project.manifest_version,
    });
    state
        .store
        .write_file(
            &state.paths.manifest(&project.folder),
            manifest.to_string().as_bytes(),
        )
        .await?;

    tracing::info!(folder = %project.folder, "created project");
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn list_projects(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ProjectRecord>>> {
    Ok(Json(state.projects.list_active().await?))
}

/// Delete = cancel + scavenge. The row flips to canceled immediately; the
/// folder and rows are purged by the scavenger.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let project = project_or_404(&state, &folder).await?;

    state
        .projects
        .set_status(project.id, ProjectStatus::Canceled)
        .await?;
    let canceled_jobs = state.repo.cancel_by_project(project.id).await?;
    if !canceled_jobs.is_empty() {
        tracing::info!(folder = %project.folder, count = canceled_jobs.len(), "canceled in-flight jobs");
    }

    let job = state
        .repo
        .enqueue(
            NewJob::new(JobType::ProjectScavenge, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_NORMAL),
        )
        .await?;
    state.bus.notify_enqueued();

    tracing::info!(folder = %project.folder, job_id = job.id, "project scheduled for scavenge");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Enqueue a commit of all pending deletions in the project.
pub async fn commit_project(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let project = project_or_404(&state, &folder).await?;
    let job = state
        .repo
        .enqueue(
            NewJob::new(JobType::CommitChanges, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_NORMAL),
        )
        .await?;
    state.bus.notify_enqueued();
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Enqueue a revert. Runs ahead of any queued commit: revert outranks
/// commit in priority, so an optimistic client can still take it back.
pub async fn revert_project(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let project = project_or_404(&state, &folder).await?;
    let job = state
        .repo
        .enqueue(
            NewJob::new(JobType::RevertChanges, JobScope::Project)
                .project(project.id)
                .priority(PRIORITY_REVERT),
        )
        .await?;
    state.bus.notify_enqueued();
    Ok((StatusCode::ACCEPTED, Json(job)))
}
