//! Photo rows: per-project originals with variant availability, keep flags
//! and derivative state.
//!
//! A row is one logical photo, keyed by `(project_id, filename)` and merged
//! across variants by `basename`: a JPEG and a RAW with the same stem share
//! a row, with `jpg_available` / `raw_available` tracking what exists on
//! disk. A pending deletion is a variant that is available but no longer
//! kept. Keep flags mirror availability whenever a variant is absent, so
//! `keep_* = false` with `*_available = true` is the only discard state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{now_ts, parse_column, Db, Result, StoreError};

/// Derivative generation state for one derivative kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeStatus {
    Pending,
    Generated,
    Missing,
    NotSupported,
}

impl fmt::Display for DerivativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DerivativeStatus::Pending => "pending",
            DerivativeStatus::Generated => "generated",
            DerivativeStatus::Missing => "missing",
            DerivativeStatus::NotSupported => "not_supported",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DerivativeStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DerivativeStatus::Pending),
            "generated" => Ok(DerivativeStatus::Generated),
            "missing" => Ok(DerivativeStatus::Missing),
            "not_supported" => Ok(DerivativeStatus::NotSupported),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl FromStr for Visibility {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            _ => Err(()),
        }
    }
}

/// File-extension class of a photo variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantClass {
    Jpeg,
    Raw,
    Other,
}

const RAW_EXTS: &[&str] = &[
    "raw", "arw", "cr2", "cr3", "nef", "dng", "orf", "rw2", "raf",
];

pub fn classify_ext(ext: &str) -> VariantClass {
    let ext = ext.to_ascii_lowercase();
    if ext == "jpg" || ext == "jpeg" {
        VariantClass::Jpeg
    } else if RAW_EXTS.contains(&ext.as_str()) {
        VariantClass::Raw
    } else {
        VariantClass::Other
    }
}

/// Split a filename into (basename, lowercased extension).
pub fn split_filename(filename: &str) -> (String, String) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_ascii_lowercase()),
        _ => (filename.to_string(), String::new()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoRecord {
    pub id: i64,
    pub project_id: i64,
    pub filename: String,
    pub basename: String,
    pub ext: String,
    pub jpg_available: bool,
    pub raw_available: bool,
    pub other_available: bool,
    pub keep_jpg: bool,
    pub keep_raw: bool,
    pub thumbnail_status: DerivativeStatus,
    pub preview_status: DerivativeStatus,
    pub orientation: i64,
    pub date_time_original: Option<String>,
    pub meta: serde_json::Value,
    pub visibility: Visibility,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PhotoRecord {
    pub fn pending_jpg(&self) -> bool {
        self.jpg_available && !self.keep_jpg
    }

    pub fn pending_raw(&self) -> bool {
        self.raw_available && !self.keep_raw
    }

    pub fn has_pending_deletion(&self) -> bool {
        self.pending_jpg() || self.pending_raw()
    }

    fn meta_ext(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }

    /// On-disk filename of the JPEG variant, when one is available.
    pub fn jpg_filename(&self) -> Option<String> {
        if !self.jpg_available {
            return None;
        }
        if classify_ext(&self.ext) == VariantClass::Jpeg {
            Some(self.filename.clone())
        } else {
            let ext = self.meta_ext("jpg_ext").unwrap_or("jpg");
            Some(format!("{}.{ext}", self.basename))
        }
    }

    /// On-disk filename of the RAW variant, when one is available.
    pub fn raw_filename(&self) -> Option<String> {
        if !self.raw_available {
            return None;
        }
        if classify_ext(&self.ext) == VariantClass::Raw {
            Some(self.filename.clone())
        } else {
            self.meta_ext("raw_ext")
                .map(|ext| format!("{}.{ext}", self.basename))
        }
    }

    pub fn other_filename(&self) -> Option<String> {
        if !self.other_available {
            return None;
        }
        if classify_ext(&self.ext) == VariantClass::Other {
            Some(self.filename.clone())
        } else {
            self.meta_ext("other_ext")
                .map(|ext| format!("{}.{ext}", self.basename))
        }
    }

    /// All on-disk variant filenames, deduplicated.
    pub fn variant_filenames(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in [
            self.jpg_filename(),
            self.raw_filename(),
            self.other_filename(),
        ]
        .into_iter()
        .flatten()
        {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

const SELECT_COLS: &str = "id, project_id, filename, basename, ext, jpg_available, raw_available, \
     other_available, keep_jpg, keep_raw, thumbnail_status, preview_status, orientation, \
     date_time_original, meta, visibility, created_at, updated_at";

fn row_to_photo(row: &SqliteRow) -> Result<PhotoRecord> {
    let thumbnail: String = row.try_get("thumbnail_status")?;
    let preview: String = row.try_get("preview_status")?;
    let visibility: String = row.try_get("visibility")?;
    let meta_raw: String = row.try_get("meta")?;
    Ok(PhotoRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        filename: row.try_get("filename")?,
        basename: row.try_get("basename")?,
        ext: row.try_get("ext")?,
        jpg_available: row.try_get("jpg_available")?,
        raw_available: row.try_get("raw_available")?,
        other_available: row.try_get("other_available")?,
        keep_jpg: row.try_get("keep_jpg")?,
        keep_raw: row.try_get("keep_raw")?,
        thumbnail_status: parse_column(&thumbnail, "thumbnail_status")?,
        preview_status: parse_column(&preview, "preview_status")?,
        orientation: row.try_get("orientation")?,
        date_time_original: row.try_get("date_time_original")?,
        meta: serde_json::from_str(&meta_raw).unwrap_or(serde_json::Value::Null),
        visibility: parse_column(&visibility, "visibility")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Per-project pending-deletion counts used by the pending-changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectPendingRow {
    pub project_folder: String,
    pub pending_total: i64,
    pub pending_jpg: i64,
    pub pending_raw: i64,
}

#[derive(Clone)]
pub struct PhotoRepo {
    db: Db,
}

impl PhotoRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register an uploaded original. Variants merge into an existing row by
    /// basename; a brand-new name inserts a fresh row. Returns the row.
    pub async fn upsert_uploaded(&self, project_id: i64, filename: &str) -> Result<PhotoRecord> {
        let (basename, ext) = split_filename(filename);
        let class = classify_ext(&ext);
        let now = now_ts();

        if let Some(existing) = self.get_by_basename(project_id, &basename).await? {
            let mut meta = match existing.meta.clone() {
                serde_json::Value::Object(m) => m,
                _ => serde_json::Map::new(),
            };
            let (jpg, raw, other) = match class {
                VariantClass::Jpeg => {
                    meta.insert("jpg_ext".into(), ext.clone().into());
                    (true, existing.raw_available, existing.other_available)
                }
                VariantClass::Raw => {
                    meta.insert("raw_ext".into(), ext.clone().into());
                    (existing.jpg_available, true, existing.other_available)
                }
                VariantClass::Other => {
                    meta.insert("other_ext".into(), ext.clone().into());
                    (existing.jpg_available, existing.raw_available, true)
                }
            };
            // A fresh upload of a variant always counts as kept; a newly
            // available JPEG re-arms derivative generation.
            let thumb = if class == VariantClass::Jpeg {
                DerivativeStatus::Pending
            } else {
                existing.thumbnail_status
            };
            let preview = if class == VariantClass::Jpeg {
                DerivativeStatus::Pending
            } else {
                existing.preview_status
            };
            sqlx::query(
                "UPDATE photos SET jpg_available = ?, raw_available = ?, other_available = ?, \
                 keep_jpg = ?, keep_raw = ?, thumbnail_status = ?, preview_status = ?, \
                 meta = ?, updated_at = ? WHERE id = ?",
            )
            .bind(jpg)
            .bind(raw)
            .bind(other)
            .bind(jpg)
            .bind(raw)
            .bind(thumb.to_string())
            .bind(preview.to_string())
            .bind(serde_json::Value::Object(meta).to_string())
            .bind(now)
            .bind(existing.id)
            .execute(self.db.pool())
            .await?;
            return self.get_by_id(existing.id).await;
        }

        let (jpg, raw, other) = match class {
            VariantClass::Jpeg => (true, false, false),
            VariantClass::Raw => (false, true, false),
            VariantClass::Other => (false, false, true),
        };
        let meta = match class {
            VariantClass::Jpeg => serde_json::json!({ "jpg_ext": ext }),
            VariantClass::Raw => serde_json::json!({ "raw_ext": ext }),
            VariantClass::Other => serde_json::json!({ "other_ext": ext }),
        };
        let thumb = if jpg {
            DerivativeStatus::Pending
        } else {
            DerivativeStatus::NotSupported
        };
        let done = sqlx::query(
            "INSERT INTO photos (project_id, filename, basename, ext, jpg_available, \
             raw_available, other_available, keep_jpg, keep_raw, thumbnail_status, \
             preview_status, meta, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(filename)
        .bind(&basename)
        .bind(&ext)
        .bind(jpg)
        .bind(raw)
        .bind(other)
        .bind(jpg)
        .bind(raw)
        .bind(thumb.to_string())
        .bind(thumb.to_string())
        .bind(meta.to_string())
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        self.get_by_id(done.last_insert_rowid()).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<PhotoRecord> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLS} FROM photos WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("photo {id}")))?;
        row_to_photo(&row)
    }

    pub async fn get(&self, project_id: i64, filename: &str) -> Result<Option<PhotoRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM photos WHERE project_id = ? AND filename = ?"
        ))
        .bind(project_id)
        .bind(filename)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_photo).transpose()
    }

    pub async fn get_by_basename(
        &self,
        project_id: i64,
        basename: &str,
    ) -> Result<Option<PhotoRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM photos WHERE project_id = ? AND basename = ? LIMIT 1"
        ))
        .bind(project_id)
        .bind(basename)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_photo).transpose()
    }

    pub async fn list_project(&self, project_id: i64) -> Result<Vec<PhotoRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM photos WHERE project_id = ? \
             ORDER BY date_time_original ASC, basename ASC, id ASC"
        ))
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_photo).collect()
    }

    /// Find the photo owning `basename` in any project other than
    /// `exclude_project`. Used to resolve cross-project upload conflicts.
    pub async fn find_owner_excluding(
        &self,
        basename: &str,
        exclude_project: i64,
    ) -> Result<Option<PhotoRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM photos WHERE basename = ? AND project_id != ? \
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(basename)
        .bind(exclude_project)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_photo).transpose()
    }

    /// Set keep flags. Discarding an unavailable variant is rejected;
    /// keep flags for unavailable variants are clamped to mirror
    /// availability.
    pub async fn set_keep_flags(
        &self,
        photo_id: i64,
        keep_jpg: Option<bool>,
        keep_raw: Option<bool>,
    ) -> Result<PhotoRecord> {
        let photo = self.get_by_id(photo_id).await?;

        if keep_jpg == Some(false) && !photo.jpg_available {
            return Err(StoreError::Invalid(
                "cannot discard jpg: variant is not available".into(),
            ));
        }
        if keep_raw == Some(false) && !photo.raw_available {
            return Err(StoreError::Invalid(
                "cannot discard raw: variant is not available".into(),
            ));
        }

        let new_jpg = keep_jpg.unwrap_or(photo.keep_jpg) && photo.jpg_available;
        let new_raw = keep_raw.unwrap_or(photo.keep_raw) && photo.raw_available;

        sqlx::query("UPDATE photos SET keep_jpg = ?, keep_raw = ?, updated_at = ? WHERE id = ?")
            .bind(new_jpg)
            .bind(new_raw)
            .bind(now_ts())
            .bind(photo_id)
            .execute(self.db.pool())
            .await?;
        self.get_by_id(photo_id).await
    }

    pub async fn set_visibility(&self, photo_id: i64, visibility: Visibility) -> Result<()> {
        sqlx::query("UPDATE photos SET visibility = ?, updated_at = ? WHERE id = ?")
            .bind(visibility.to_string())
            .bind(now_ts())
            .bind(photo_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_derivative_status(
        &self,
        photo_id: i64,
        thumbnail: Option<DerivativeStatus>,
        preview: Option<DerivativeStatus>,
    ) -> Result<()> {
        if thumbnail.is_none() && preview.is_none() {
            return Ok(());
        }
        let mut sets = Vec::new();
        if thumbnail.is_some() {
            sets.push("thumbnail_status = ?");
        }
        if preview.is_some() {
            sets.push("preview_status = ?");
        }
        let key = format!(
            "photos:setDerivative:{}:{}",
            thumbnail.is_some(),
            preview.is_some()
        );
        let sql = self.db.statements().sql(&key, || {
            format!(
                "UPDATE photos SET {}, updated_at = ? WHERE id = ?",
                sets.join(", ")
            )
        })?;

        let mut query = sqlx::query(&sql);
        if let Some(t) = thumbnail {
            query = query.bind(t.to_string());
        }
        if let Some(p) = preview {
            query = query.bind(p.to_string());
        }
        query
            .bind(now_ts())
            .bind(photo_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_analysis(
        &self,
        photo_id: i64,
        date_time_original: Option<&str>,
        orientation: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE photos SET \
             date_time_original = COALESCE(?, date_time_original), \
             orientation = COALESCE(?, orientation), \
             updated_at = ? WHERE id = ?",
        )
        .bind(date_time_original)
        .bind(orientation)
        .bind(now_ts())
        .bind(photo_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Clear committed-away variants. Availability and keep flags drop
    /// together; removing the JPEG also marks derivatives missing. Returns
    /// the updated row, or `None` when the row ended with no availabilities
    /// and was deleted.
    pub async fn apply_commit(
        &self,
        photo_id: i64,
        clear_jpg: bool,
        clear_raw: bool,
    ) -> Result<Option<PhotoRecord>> {
        let photo = self.get_by_id(photo_id).await?;
        let jpg = photo.jpg_available && !clear_jpg;
        let raw = photo.raw_available && !clear_raw;

        if !jpg && !raw && !photo.other_available {
            self.delete(photo_id).await?;
            return Ok(None);
        }

        let (thumb, preview) = if clear_jpg {
            (DerivativeStatus::Missing, DerivativeStatus::Missing)
        } else {
            (photo.thumbnail_status, photo.preview_status)
        };
        sqlx::query(
            "UPDATE photos SET jpg_available = ?, raw_available = ?, keep_jpg = ?, \
             keep_raw = ?, thumbnail_status = ?, preview_status = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(jpg)
        .bind(raw)
        .bind(jpg)
        .bind(raw)
        .bind(thumb.to_string())
        .bind(preview.to_string())
        .bind(now_ts())
        .bind(photo_id)
        .execute(self.db.pool())
        .await?;
        Ok(Some(self.get_by_id(photo_id).await?))
    }

    pub async fn delete(&self, photo_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM photos WHERE id = ?")
            .bind(photo_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Re-home a photo row to `dest_project_id`. Overwrites a co-named row
    /// at the destination and optionally resets derivative statuses for
    /// derivatives that did not travel with the originals.
    pub async fn move_to_project(
        &self,
        photo_id: i64,
        dest_project_id: i64,
        reset_thumbnail: bool,
        reset_preview: bool,
    ) -> Result<PhotoRecord> {
        let photo = self.get_by_id(photo_id).await?;
        let now = now_ts();
        self.db
            .with_tx(move |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM photos WHERE project_id = ? AND filename = ? AND id != ?")
                        .bind(dest_project_id)
                        .bind(&photo.filename)
                        .bind(photo_id)
                        .execute(&mut *conn)
                        .await?;

                    let thumb = if reset_thumbnail {
                        DerivativeStatus::Pending
                    } else {
                        photo.thumbnail_status
                    };
                    let preview = if reset_preview {
                        DerivativeStatus::Pending
                    } else {
                        photo.preview_status
                    };
                    sqlx::query(
                        "UPDATE photos SET project_id = ?, thumbnail_status = ?, \
                         preview_status = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(dest_project_id)
                    .bind(thumb.to_string())
                    .bind(preview.to_string())
                    .bind(now)
                    .bind(photo_id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await?;
        self.get_by_id(photo_id).await
    }

    /// Restore keep flags to mirror availability for a whole project.
    /// Returns the number of rows touched.
    pub async fn reset_keep_to_availability(&self, project_id: i64) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE photos SET keep_jpg = jpg_available, keep_raw = raw_available, \
             updated_at = ? WHERE project_id = ? \
             AND (keep_jpg != jpg_available OR keep_raw != raw_available)",
        )
        .bind(now_ts())
        .bind(project_id)
        .execute(self.db.pool())
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn photos_with_pending(&self, project_id: i64) -> Result<Vec<PhotoRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM photos WHERE project_id = ? \
             AND ((jpg_available = 1 AND keep_jpg = 0) OR (raw_available = 1 AND keep_raw = 0)) \
             ORDER BY basename ASC, id ASC"
        ))
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_photo).collect()
    }

    /// Pending-deletion counts grouped by active project folder, for the
    /// pending-changes snapshot. Projects without pending work are omitted.
    pub async fn pending_counts(&self) -> Result<Vec<ProjectPendingRow>> {
        let rows = sqlx::query(
            "SELECT pr.folder AS project_folder, \
                SUM(CASE WHEN ph.jpg_available = 1 AND ph.keep_jpg = 0 THEN 1 ELSE 0 END) AS pending_jpg, \
                SUM(CASE WHEN ph.raw_available = 1 AND ph.keep_raw = 0 THEN 1 ELSE 0 END) AS pending_raw, \
                SUM(CASE WHEN (ph.jpg_available = 1 AND ph.keep_jpg = 0) \
                          OR (ph.raw_available = 1 AND ph.keep_raw = 0) THEN 1 ELSE 0 END) AS pending_total \
             FROM photos ph \
             JOIN projects pr ON pr.id = ph.project_id \
             WHERE pr.tenant_id = ? AND pr.status = 'active' \
             GROUP BY pr.folder \
             HAVING pending_total > 0 \
             ORDER BY pr.folder ASC",
        )
        .bind(self.db.tenant())
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ProjectPendingRow {
                    project_folder: row.try_get("project_folder")?,
                    pending_total: row.try_get("pending_total")?,
                    pending_jpg: row.try_get("pending_jpg")?,
                    pending_raw: row.try_get("pending_raw")?,
                })
            })
            .collect()
    }

    /// Projects (by id) that currently have pending deletions.
    pub async fn project_ids_with_pending(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ph.project_id FROM photos ph \
             JOIN projects pr ON pr.id = ph.project_id \
             WHERE pr.status = 'active' \
             AND ((ph.jpg_available = 1 AND ph.keep_jpg = 0) \
               OR (ph.raw_available = 1 AND ph.keep_raw = 0)) \
             ORDER BY ph.project_id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("project_id"))
            .collect())
    }

    /// Reconcile one basename group against what the manifest check found on
    /// disk. Inserts a row for disk-only groups; availability flags follow
    /// the filesystem for existing rows. Returns `(row, inserted)` or `None`
    /// when the row ended empty and was removed.
    pub async fn reconcile_variants(
        &self,
        project_id: i64,
        basename: &str,
        jpg_ext: Option<&str>,
        raw_ext: Option<&str>,
        other_ext: Option<&str>,
    ) -> Result<Option<(PhotoRecord, bool)>> {
        let now = now_ts();
        let existing = self.get_by_basename(project_id, basename).await?;

        let Some(photo) = existing else {
            // Disk-only group: insert a fresh row from the principal variant.
            let (filename, _ext) = if let Some(ext) = jpg_ext {
                (format!("{basename}.{ext}"), ext)
            } else if let Some(ext) = raw_ext {
                (format!("{basename}.{ext}"), ext)
            } else if let Some(ext) = other_ext {
                (format!("{basename}.{ext}"), ext)
            } else {
                return Ok(None);
            };
            let mut photo = self.upsert_uploaded(project_id, &filename).await?;
            // Register the remaining variants on the same row.
            for extra in [jpg_ext, raw_ext, other_ext].into_iter().flatten() {
                let name = format!("{basename}.{extra}");
                if name != photo.filename {
                    photo = self.upsert_uploaded(project_id, &name).await?;
                }
            }
            return Ok(Some((photo, true)));
        };

        let jpg = jpg_ext.is_some();
        let raw = raw_ext.is_some();
        let other = other_ext.is_some();

        if !jpg && !raw && !other {
            // Row-only group with nothing on disk at all.
            self.delete(photo.id).await?;
            return Ok(None);
        }

        let mut meta = match photo.meta.clone() {
            serde_json::Value::Object(m) => m,
            _ => serde_json::Map::new(),
        };
        if let Some(ext) = jpg_ext {
            meta.insert("jpg_ext".into(), ext.into());
        }
        if let Some(ext) = raw_ext {
            meta.insert("raw_ext".into(), ext.into());
        }
        if let Some(ext) = other_ext {
            meta.insert("other_ext".into(), ext.into());
        }

        // JPEG lost on disk eliminates the derivative source; a JPEG that
        // appeared re-arms generation.
        let (thumb, preview) = if !jpg && photo.jpg_available {
            (DerivativeStatus::Missing, DerivativeStatus::Missing)
        } else if jpg && !photo.jpg_available {
            (DerivativeStatus::Pending, DerivativeStatus::Pending)
        } else {
            (photo.thumbnail_status, photo.preview_status)
        };

        let keep_jpg = jpg && (photo.keep_jpg || !photo.jpg_available);
        let keep_raw = raw && (photo.keep_raw || !photo.raw_available);

        sqlx::query(
            "UPDATE photos SET jpg_available = ?, raw_available = ?, other_available = ?, \
             keep_jpg = ?, keep_raw = ?, thumbnail_status = ?, preview_status = ?, \
             meta = ?, updated_at = ? WHERE id = ?",
        )
        .bind(jpg)
        .bind(raw)
        .bind(other)
        .bind(keep_jpg)
        .bind(keep_raw)
        .bind(thumb.to_string())
        .bind(preview.to_string())
        .bind(serde_json::Value::Object(meta).to_string())
        .bind(now)
        .bind(photo.id)
        .execute(self.db.pool())
        .await?;
        Ok(Some((self.get_by_id(photo.id).await?, false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;

    async fn fixture() -> (tempfile::TempDir, Db, i64) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), "default").await.unwrap();
        let project = ProjectRepo::new(db.clone()).create("Trip").await.unwrap();
        (dir, db, project.id)
    }

    #[test]
    fn extension_classes() {
        assert_eq!(classify_ext("JPG"), VariantClass::Jpeg);
        assert_eq!(classify_ext("jpeg"), VariantClass::Jpeg);
        assert_eq!(classify_ext("ARW"), VariantClass::Raw);
        assert_eq!(classify_ext("png"), VariantClass::Other);
    }

    #[test]
    fn split_filename_handles_dotless_names() {
        assert_eq!(
            split_filename("IMG_001.JPG"),
            ("IMG_001".to_string(), "jpg".to_string())
        );
        assert_eq!(split_filename("README"), ("README".to_string(), String::new()));
    }

    #[tokio::test]
    async fn upload_merges_variants_by_basename() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);

        let first = repo.upsert_uploaded(project_id, "IMG_001.arw").await.unwrap();
        assert!(first.raw_available && !first.jpg_available);
        assert_eq!(first.thumbnail_status, DerivativeStatus::NotSupported);

        let merged = repo.upsert_uploaded(project_id, "IMG_001.jpg").await.unwrap();
        assert_eq!(merged.id, first.id);
        assert!(merged.jpg_available && merged.raw_available);
        assert_eq!(merged.thumbnail_status, DerivativeStatus::Pending);
        assert_eq!(merged.raw_filename().as_deref(), Some("IMG_001.arw"));
        assert_eq!(merged.jpg_filename().as_deref(), Some("IMG_001.jpg"));
    }

    #[tokio::test]
    async fn discarding_unavailable_variant_is_rejected() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);
        let photo = repo.upsert_uploaded(project_id, "IMG_002.jpg").await.unwrap();

        let err = repo
            .set_keep_flags(photo.id, None, Some(false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let photo = repo
            .set_keep_flags(photo.id, Some(false), None)
            .await
            .unwrap();
        assert!(photo.pending_jpg());
        assert!(photo.has_pending_deletion());
    }

    #[tokio::test]
    async fn revert_restores_keep_to_availability() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);
        let a = repo.upsert_uploaded(project_id, "a.jpg").await.unwrap();
        let _b = repo.upsert_uploaded(project_id, "b.jpg").await.unwrap();
        repo.set_keep_flags(a.id, Some(false), None).await.unwrap();

        let touched = repo.reset_keep_to_availability(project_id).await.unwrap();
        assert_eq!(touched, 1);

        let a = repo.get_by_id(a.id).await.unwrap();
        assert_eq!(a.keep_jpg, a.jpg_available);
        assert_eq!(a.keep_raw, a.raw_available);
        assert!(!a.has_pending_deletion());
    }

    #[tokio::test]
    async fn apply_commit_deletes_empty_rows() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);
        let photo = repo.upsert_uploaded(project_id, "gone.jpg").await.unwrap();

        let out = repo.apply_commit(photo.id, true, false).await.unwrap();
        assert!(out.is_none());
        assert!(matches!(
            repo.get_by_id(photo.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn apply_commit_partial_marks_derivatives_missing() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);
        repo.upsert_uploaded(project_id, "pair.arw").await.unwrap();
        let photo = repo.upsert_uploaded(project_id, "pair.jpg").await.unwrap();

        let photo = repo
            .apply_commit(photo.id, true, false)
            .await
            .unwrap()
            .expect("row survives with raw variant");
        assert!(!photo.jpg_available);
        assert!(photo.raw_available);
        assert!(!photo.keep_jpg);
        assert!(photo.keep_raw);
        assert_eq!(photo.thumbnail_status, DerivativeStatus::Missing);
        assert_eq!(photo.preview_status, DerivativeStatus::Missing);
    }

    #[tokio::test]
    async fn pending_counts_groups_by_folder() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db.clone());
        repo.upsert_uploaded(project_id, "x.arw").await.unwrap();
        let x = repo.upsert_uploaded(project_id, "x.jpg").await.unwrap();
        let y = repo.upsert_uploaded(project_id, "y.jpg").await.unwrap();
        repo.set_keep_flags(x.id, Some(false), Some(false)).await.unwrap();
        repo.set_keep_flags(y.id, Some(false), None).await.unwrap();

        let counts = repo.pending_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].project_folder, "trip");
        assert_eq!(counts[0].pending_total, 2);
        assert_eq!(counts[0].pending_jpg, 2);
        assert_eq!(counts[0].pending_raw, 1);
    }

    #[tokio::test]
    async fn move_overwrites_co_named_destination_row() {
        let (_dir, db, source_id) = fixture().await;
        let projects = ProjectRepo::new(db.clone());
        let dest = projects.create("Dest").await.unwrap();
        let repo = PhotoRepo::new(db);

        let moving = repo.upsert_uploaded(source_id, "dup.jpg").await.unwrap();
        let shadow = repo.upsert_uploaded(dest.id, "dup.jpg").await.unwrap();

        let moved = repo
            .move_to_project(moving.id, dest.id, true, true)
            .await
            .unwrap();
        assert_eq!(moved.project_id, dest.id);
        assert_eq!(moved.thumbnail_status, DerivativeStatus::Pending);
        assert!(matches!(
            repo.get_by_id(shadow.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_inserts_and_removes() {
        let (_dir, db, project_id) = fixture().await;
        let repo = PhotoRepo::new(db);

        // Disk-only group inserts a merged row.
        let (photo, inserted) = repo
            .reconcile_variants(project_id, "new", Some("jpg"), Some("arw"), None)
            .await
            .unwrap()
            .unwrap();
        assert!(inserted);
        assert!(photo.jpg_available && photo.raw_available);

        // JPEG disappearing marks derivatives missing.
        let (photo, inserted) = repo
            .reconcile_variants(project_id, "new", None, Some("arw"), None)
            .await
            .unwrap()
            .unwrap();
        assert!(!inserted);
        assert!(!photo.jpg_available);
        assert_eq!(photo.thumbnail_status, DerivativeStatus::Missing);

        // Nothing left on disk removes the row.
        let gone = repo
            .reconcile_variants(project_id, "new", None, None, None)
            .await
            .unwrap();
        assert!(gone.is_none());
    }
}
