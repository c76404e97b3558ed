//! Job submission and inspection endpoints.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use lumen_jobs::handlers::PRIORITY_NORMAL;
use lumen_jobs::{
    ItemsSummary, JobRecord, JobScope, JobStatus, JobType, ListFilter, NewJob,
};

use crate::error::{ApiError, ApiResult};
use crate::routes::project_or_404;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: Option<i64>,
    pub payload: Option<serde_json::Value>,
}

/// Submit a job scoped to a project. Unknown types are rejected here,
/// before anything reaches the queue.
pub async fn submit_job(
    State(state): State<AppState>,
    Path(folder): Path<String>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let project = project_or_404(&state, &folder).await?;
    let job_type = JobType::from_str(&request.job_type)?;

    let mut new = NewJob::new(job_type, JobScope::Project)
        .project(project.id)
        .priority(request.priority.unwrap_or(PRIORITY_NORMAL));
    if let Some(payload) = request.payload {
        new = new.payload(payload);
    }

    let job = state.repo.enqueue(new).await?;
    state.bus.notify_enqueued();
    tracing::info!(job_id = job.id, job_type = %job.job_type, folder, "job submitted");
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Path(folder): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    let project = project_or_404(&state, &folder).await?;

    let status = query
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(|_| ApiError::BadRequest("unknown status filter".into()))?;
    let job_type = query
        .job_type
        .as_deref()
        .map(JobType::from_str)
        .transpose()?;

    let jobs = state
        .repo
        .list(&ListFilter {
            project_id: Some(project.id),
            status,
            job_type,
            limit: query.limit.unwrap_or(100).clamp(1, 500),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: JobRecord,
    pub items_summary: ItemsSummary,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobDetail>> {
    let job = state.repo.get(id).await?;
    let items_summary = state.repo.items_summary(id).await?;
    Ok(Json(JobDetail { job, items_summary }))
}

/// User-initiated cancel. Running handlers observe it at the next item
/// boundary; completed items stay completed.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRecord>> {
    state.repo.cancel(id).await?;
    let job = state.repo.get(id).await?;
    state
        .bus
        .publish_job(lumen_jobs::JobEvent::for_job(&job, None));
    Ok(Json(job))
}
