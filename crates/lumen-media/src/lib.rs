//! Capability boundaries between the Lumen scheduler and the outside world.
//!
//! Two traits abstract everything side-effecting that is not the database:
//!
//! - [`ImageProcessor`] turns an original into derivative JPEGs. The codec
//!   itself lives behind this trait; the bundled [`MockProcessor`] serves
//!   tests and development wiring.
//! - [`ProjectStore`] owns the project folder tree rooted at the configured
//!   projects root. [`LocalProjectStore`] is the local-filesystem backend.
//!
//! Implementations must be `Send + Sync + 'static` to cross worker task
//! boundaries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod local;
pub mod mock;

pub use local::LocalProjectStore;
pub use mock::MockProcessor;

/// Derivative subfolder names inside a project directory.
pub const THUMB_DIR: &str = ".thumb";
pub const PREVIEW_DIR: &str = ".preview";

/// Name of the per-project manifest file.
pub const MANIFEST_FILE: &str = "manifest.json";

pub type Result<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported source format: {0}")]
    Unsupported(String),

    #[error("destination exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two derivative kinds Lumen generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeKind {
    Thumbnail,
    Preview,
}

impl DerivativeKind {
    pub fn dir(&self) -> &'static str {
        match self {
            DerivativeKind::Thumbnail => THUMB_DIR,
            DerivativeKind::Preview => PREVIEW_DIR,
        }
    }
}

/// One requested derivative.
#[derive(Debug, Clone)]
pub struct DerivativeSpec {
    pub kind: DerivativeKind,
    /// Fit-inside bounding box; sources are never enlarged.
    pub max_dim: u32,
    /// JPEG quality, clamped to [1, 100] by implementations.
    pub quality: u8,
    pub output_path: PathBuf,
}

impl DerivativeSpec {
    pub fn clamped_quality(&self) -> u8 {
        self.quality.clamp(1, 100)
    }
}

/// A successfully written derivative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeOutput {
    pub kind: DerivativeKind,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub format: &'static str,
}

/// Per-derivative outcome: a processor may succeed on one kind and reject
/// another for the same source.
#[derive(Debug)]
pub struct DerivativeOutcome {
    pub kind: DerivativeKind,
    pub result: Result<DerivativeOutput>,
}

/// Image processing capability.
///
/// Implementations auto-rotate from source EXIF, fit inside the requested
/// box without enlarging, and write progressive JPEGs. A source the codec
/// cannot decode yields `MediaError::Unsupported` per derivative; a missing
/// source fails the whole call with `MediaError::NotFound`.
#[async_trait]
pub trait ImageProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        source: &Path,
        specs: &[DerivativeSpec],
    ) -> Result<Vec<DerivativeOutcome>>;
}

/// Project-folder storage capability. All paths are rooted at the configured
/// projects root; callers build them through [`ProjectPaths`].
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    /// Create the project directory and its derivative subfolders.
    async fn ensure_project_dirs(&self, tenant: &str, folder: &str) -> Result<()>;

    /// Move a file, creating parent directories at the destination. With
    /// `overwrite` the destination is replaced; without it an existing
    /// destination is an error.
    async fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()>;

    async fn path_exists(&self, path: &Path) -> bool;

    /// Recursively delete a directory tree. Missing trees are a no-op.
    async fn remove_tree(&self, path: &Path) -> Result<()>;

    /// Delete a single file. Missing files are a no-op.
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Plain files directly inside `dir` (no recursion), sorted by name.
    async fn list_files(&self, dir: &Path) -> Result<Vec<String>>;

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Path layout helper: `{projects_root}/{tenant}/{folder}/...`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
    tenant: String,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>, tenant: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            tenant: tenant.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn project_dir(&self, folder: &str) -> PathBuf {
        self.root.join(&self.tenant).join(folder)
    }

    pub fn original(&self, folder: &str, filename: &str) -> PathBuf {
        self.project_dir(folder).join(filename)
    }

    pub fn derivative(&self, folder: &str, kind: DerivativeKind, basename: &str) -> PathBuf {
        self.project_dir(folder)
            .join(kind.dir())
            .join(format!("{basename}.jpg"))
    }

    pub fn manifest(&self, folder: &str) -> PathBuf {
        self.project_dir(folder).join(MANIFEST_FILE)
    }
}
