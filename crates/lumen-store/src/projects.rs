//! Project rows: named photo collections with an on-disk folder slug.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{now_ts, parse_column, Db, Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Canceled,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectStatus::Active => write!(f, "active"),
            ProjectStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProjectStatus::Active),
            "canceled" => Ok(ProjectStatus::Canceled),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub tenant_id: String,
    pub folder: String,
    pub name: String,
    pub status: ProjectStatus,
    pub manifest_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_project(row: &SqliteRow) -> Result<ProjectRecord> {
    let status: String = row.try_get("status")?;
    Ok(ProjectRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        folder: row.try_get("folder")?,
        name: row.try_get("name")?,
        status: parse_column(&status, "project status")?,
        manifest_version: row.try_get("manifest_version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_COLS: &str =
    "id, tenant_id, folder, name, status, manifest_version, created_at, updated_at";

/// Derive a URL-safe folder slug from a display name.
///
/// Lowercased ASCII alphanumerics, runs of anything else collapsed to a
/// single dash. Empty results fall back to "project".
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

#[derive(Clone)]
pub struct ProjectRepo {
    db: Db,
}

impl ProjectRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a project with a unique folder slug derived from `name`.
    ///
    /// Folder slugs are never reused while a project exists: collisions get
    /// a numeric suffix (`trip`, `trip-2`, ...).
    pub async fn create(&self, name: &str) -> Result<ProjectRecord> {
        let base = slugify(name);
        let now = now_ts();
        let tenant = self.db.tenant().to_string();

        for attempt in 0..50u32 {
            let folder = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{}", attempt + 1)
            };
            let res = sqlx::query(
                "INSERT INTO projects (tenant_id, folder, name, status, created_at, updated_at) \
                 VALUES (?, ?, ?, 'active', ?, ?)",
            )
            .bind(&tenant)
            .bind(&folder)
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(self.db.pool())
            .await;

            match res {
                Ok(done) => {
                    tracing::info!(folder, "created project");
                    return self.get_by_id(done.last_insert_rowid()).await;
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Invalid(format!(
            "could not find a free folder slug for {name:?}"
        )))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<ProjectRecord> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLS} FROM projects WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        row_to_project(&row)
    }

    pub async fn get_by_folder(&self, folder: &str) -> Result<Option<ProjectRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM projects WHERE folder = ?"
        ))
        .bind(folder)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    /// Active projects only; canceled ones are invisible to listing but may
    /// still own rows pending scavenge.
    pub async fn list_active(&self) -> Result<Vec<ProjectRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM projects \
             WHERE tenant_id = ? AND status = 'active' ORDER BY created_at DESC, id DESC"
        ))
        .bind(self.db.tenant())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_project).collect()
    }

    pub async fn set_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now_ts())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Remove the row; photos cascade, jobs keep a NULL project reference.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn bump_manifest_version(&self, id: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE projects SET manifest_version = manifest_version + 1, updated_at = ? \
             WHERE id = ? RETURNING manifest_version",
        )
        .bind(now_ts())
        .bind(id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.try_get("manifest_version")?)
    }
}
