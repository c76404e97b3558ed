//! Global application state shared across all handlers.

use std::sync::Arc;

use lumen_jobs::{EventBus, JobsRepository, MediaConfig};
use lumen_media::{ProjectPaths, ProjectStore};
use lumen_store::{Db, PhotoRepo, ProjectRepo, PublicHashRepo};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub repo: JobsRepository,
    pub photos: PhotoRepo,
    pub projects: ProjectRepo,
    pub hashes: PublicHashRepo,
    pub bus: EventBus,
    pub store: Arc<dyn ProjectStore>,
    pub paths: ProjectPaths,
    pub media: MediaConfig,
}

impl AppState {
    pub fn new(
        db: Db,
        store: Arc<dyn ProjectStore>,
        paths: ProjectPaths,
        bus: EventBus,
        media: MediaConfig,
    ) -> Self {
        Self {
            repo: JobsRepository::new(db.clone()),
            photos: PhotoRepo::new(db.clone()),
            projects: ProjectRepo::new(db.clone()),
            hashes: PublicHashRepo::new(db.clone()),
            db,
            bus,
            store,
            paths,
            media,
        }
    }
}
