//! Photo endpoints: upload, listing, keep flags, visibility and assets.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use lumen_jobs::{pending, JobRecord, JobScope, JobType, NewItem, NewJob};
use lumen_media::DerivativeKind;
use lumen_store::{HashCheck, PhotoRecord, PublicHashRecord, Visibility};

use crate::error::{ApiError, ApiResult};
use crate::routes::project_or_404;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uploaded: Vec<String>,
    pub jobs: Vec<JobRecord>,
}

/// Multipart upload of originals. Files land in the project folder; row
/// creation, conflict detection and derivative scheduling run through an
/// `upload_postprocess` job.
pub async fn upload_photos(
    State(state): State<AppState>,
    Path(folder): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let project = project_or_404(&state, &folder).await?;
    state
        .store
        .ensure_project_dirs(state.paths.tenant(), &project.folder)
        .await?;

    let mut uploaded = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            return Err(ApiError::BadRequest("file field without a filename".into()));
        };
        if filename.is_empty() {
            return Err(ApiError::BadRequest("empty filename".into()));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read file: {e}")))?;

        state
            .store
            .write_file(&state.paths.original(&project.folder, &filename), &bytes)
            .await?;
        tracing::info!(folder = %project.folder, filename, size = bytes.len(), "stored upload");
        uploaded.push(filename);
    }

    if uploaded.is_empty() {
        return Err(ApiError::BadRequest("no files in upload".into()));
    }

    let items = uploaded.iter().map(NewItem::filename).collect();
    let jobs = state
        .repo
        .enqueue_with_items(
            NewJob::new(JobType::UploadPostprocess, JobScope::PhotoSet)
                .project(project.id)
                .priority(lumen_jobs::handlers::PRIORITY_HIGH),
            items,
            true,
        )
        .await?;
    state.bus.notify_enqueued();

    Ok((StatusCode::ACCEPTED, Json(UploadResponse { uploaded, jobs })))
}

/// Strip any path components a client smuggles into the filename.
fn sanitize_filename(raw: &str) -> String {
    raw.rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

pub async fn list_photos(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> ApiResult<Json<Vec<PhotoRecord>>> {
    let project = project_or_404(&state, &folder).await?;
    Ok(Json(state.photos.list_project(project.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct KeepRequest {
    pub keep_jpg: Option<bool>,
    pub keep_raw: Option<bool>,
}

/// Set keep flags; availability without keep is a pending deletion that a
/// later commit resolves.
pub async fn set_keep_flags(
    State(state): State<AppState>,
    Path((folder, filename)): Path<(String, String)>,
    Json(request): Json<KeepRequest>,
) -> ApiResult<Json<PhotoRecord>> {
    let project = project_or_404(&state, &folder).await?;
    let photo = state
        .photos
        .get(project.id, &filename)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("photo {filename}")))?;

    let photo = state
        .photos
        .set_keep_flags(photo.id, request.keep_jpg, request.keep_raw)
        .await?;
    pending::publish_snapshot(&state.photos, &state.bus).await?;
    Ok(Json(photo))
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
pub struct VisibilityResponse {
    pub photo: PhotoRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<PublicHashRecord>,
}

/// Toggle visibility. Going public ensures an active hash; going private
/// invalidates any hash immediately.
pub async fn set_visibility(
    State(state): State<AppState>,
    Path((folder, filename)): Path<(String, String)>,
    Json(request): Json<VisibilityRequest>,
) -> ApiResult<Json<VisibilityResponse>> {
    let project = project_or_404(&state, &folder).await?;
    let photo = state
        .photos
        .get(project.id, &filename)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("photo {filename}")))?;

    state.photos.set_visibility(photo.id, request.visibility).await?;
    let hash = match request.visibility {
        Visibility::Public => Some(
            state
                .hashes
                .ensure(photo.id, Utc::now(), state.media.hash_ttl_secs())
                .await?,
        ),
        Visibility::Private => {
            state.hashes.invalidate(photo.id).await?;
            None
        }
    };

    let photo = state.photos.get_by_id(photo.id).await?;
    Ok(Json(VisibilityResponse { photo, hash }))
}

#[derive(Debug, Deserialize)]
pub struct AssetQuery {
    #[serde(default)]
    pub variant: AssetVariant,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetVariant {
    #[default]
    Original,
    Thumbnail,
    Preview,
}

/// Serve a photo asset.
///
/// Private photos answer 404, indistinguishable from absence. Public
/// photos require the active hash; a missing or expired hash is rejected
/// as `missing`, a wrong one as `mismatch`.
pub async fn get_asset(
    State(state): State<AppState>,
    Path((folder, filename)): Path<(String, String)>,
    Query(query): Query<AssetQuery>,
) -> ApiResult<impl IntoResponse> {
    let project = project_or_404(&state, &folder).await?;
    let photo = state
        .photos
        .get(project.id, &filename)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("photo {filename}")))?;

    if photo.visibility == Visibility::Private {
        return Err(ApiError::NotFound(format!("photo {filename}")));
    }

    match state
        .hashes
        .validate(photo.id, query.hash.as_deref(), Utc::now())
        .await?
    {
        HashCheck::Valid => {}
        // An expired hash is absent as far as the edge is concerned.
        HashCheck::Missing | HashCheck::Expired => {
            return Err(ApiError::Unauthorized { reason: "missing" });
        }
        HashCheck::Mismatch => {
            return Err(ApiError::Unauthorized { reason: "mismatch" });
        }
    }

    let (path, content_type) = match query.variant {
        AssetVariant::Original => {
            let name = photo.jpg_filename().unwrap_or_else(|| photo.filename.clone());
            let content_type = content_type_for(&name);
            (state.paths.original(&project.folder, &name), content_type)
        }
        AssetVariant::Thumbnail => (
            state
                .paths
                .derivative(&project.folder, DerivativeKind::Thumbnail, &photo.basename),
            "image/jpeg",
        ),
        AssetVariant::Preview => (
            state
                .paths
                .derivative(&project.folder, DerivativeKind::Preview, &photo.basename),
            "image/jpeg",
        ),
    };

    let bytes = state.store.read_file(&path).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
