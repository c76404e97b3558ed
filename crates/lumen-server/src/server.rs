//! Router assembly and server entry point.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes::{jobs, photos, projects};
use crate::sse;
use crate::state::AppState;
use crate::ServerConfig;

/// Uploads carry originals; 256 MiB covers bursts of full-size RAWs.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Projects
        .route(
            "/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route("/projects/:folder", delete(projects::delete_project))
        .route("/projects/:folder/commit", post(projects::commit_project))
        .route("/projects/:folder/revert", post(projects::revert_project))
        // Photos
        .route(
            "/projects/:folder/photos",
            post(photos::upload_photos).get(photos::list_photos),
        )
        .route(
            "/projects/:folder/photos/:filename/keep",
            post(photos::set_keep_flags),
        )
        .route(
            "/projects/:folder/photos/:filename/visibility",
            post(photos::set_visibility),
        )
        .route(
            "/projects/:folder/photos/:filename/asset",
            get(photos::get_asset),
        )
        // Jobs
        .route(
            "/projects/:folder/jobs",
            post(jobs::submit_job).get(jobs::list_jobs),
        )
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        // Event streams
        .route("/jobs/stream", get(sse::jobs_stream))
        .route("/pending-changes", get(sse::pending_stream))
        // Health check
        .route(
            "/healthz",
            get(|| async {
                axum::Json(serde_json::json!({
                    "status": "ok",
                    "service": "lumen",
                }))
            }),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn run_server(config: ServerConfig, state: AppState) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("lumen listening on http://{addr}");
    tracing::info!("   jobs stream:     http://{addr}/jobs/stream");
    tracing::info!("   pending changes: http://{addr}/pending-changes");
    axum::serve(listener, app).await
}
