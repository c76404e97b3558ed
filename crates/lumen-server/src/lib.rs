//! Lumen HTTP surface.
//!
//! REST endpoints for projects, photos and job submission, plus two
//! Server-Sent-Events streams: job progress and pending-changes snapshots.
//! Everything side-effecting goes through the job pipeline; route handlers
//! only validate, enqueue and read.

pub mod error;
pub mod routes;
pub mod server;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use server::{build_router, run_server};
pub use state::AppState;

/// Listener configuration for the API server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}
