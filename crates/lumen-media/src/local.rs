//! Local-filesystem project store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{MediaError, ProjectStore, Result, PREVIEW_DIR, THUMB_DIR};

/// Project storage on the local filesystem, rooted at `projects_root`.
#[derive(Debug, Clone)]
pub struct LocalProjectStore {
    root: PathBuf,
}

impl LocalProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ProjectStore for LocalProjectStore {
    async fn ensure_project_dirs(&self, tenant: &str, folder: &str) -> Result<()> {
        let dir = self.root.join(tenant).join(folder);
        tokio::fs::create_dir_all(dir.join(THUMB_DIR)).await?;
        tokio::fs::create_dir_all(dir.join(PREVIEW_DIR)).await?;
        Ok(())
    }

    async fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        if !tokio::fs::try_exists(from).await.unwrap_or(false) {
            return Err(MediaError::NotFound(from.to_path_buf()));
        }
        if !overwrite && tokio::fs::try_exists(to).await.unwrap_or(false) {
            return Err(MediaError::AlreadyExists(to.to_path_buf()));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            // Cross-device moves fall back to copy + remove.
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                tracing::debug!(from = %from.display(), to = %to.display(), "cross-device move");
                tokio::fs::copy(from, to).await?;
                tokio::fs::remove_file(from).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let ft = entry.file_type().await?;
            if ft.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MediaError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    17 // ERROR_NOT_SAME_DEVICE maps differently; rename errors fall through
}
