//! Rotating per-photo access hashes.
//!
//! A public photo carries at most one active hash; a hash past its expiry is
//! treated as absent. Rotation replaces the row in place so stale tokens die
//! the moment a new one is issued.

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{Db, Result};

/// 64 alphanumeric chars ≈ 380 bits, comfortably past the 40-char floor.
const HASH_LEN: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct PublicHashRecord {
    pub id: i64,
    pub photo_id: i64,
    pub hash: String,
    pub rotated_at: i64,
    pub expires_at: i64,
}

/// Outcome of validating a supplied hash against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    Valid,
    Missing,
    Expired,
    Mismatch,
}

impl HashCheck {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            HashCheck::Valid => None,
            HashCheck::Missing => Some("missing"),
            HashCheck::Expired => Some("expired"),
            HashCheck::Mismatch => Some("mismatch"),
        }
    }
}

fn row_to_hash(row: &SqliteRow) -> Result<PublicHashRecord> {
    Ok(PublicHashRecord {
        id: row.try_get("id")?,
        photo_id: row.try_get("photo_id")?,
        hash: row.try_get("hash")?,
        rotated_at: row.try_get("rotated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(HASH_LEN)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct PublicHashRepo {
    db: Db,
}

impl PublicHashRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, photo_id: i64) -> Result<Option<PublicHashRecord>> {
        let row = sqlx::query(
            "SELECT id, photo_id, hash, rotated_at, expires_at \
             FROM photo_public_hashes WHERE photo_id = ?",
        )
        .bind(photo_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_hash).transpose()
    }

    /// Return the active hash for a photo, issuing one when no live hash
    /// exists. An expired hash counts as absent and is replaced.
    pub async fn ensure(
        &self,
        photo_id: i64,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<PublicHashRecord> {
        if let Some(existing) = self.get(photo_id).await? {
            if existing.expires_at > now.timestamp() {
                return Ok(existing);
            }
        }
        self.rotate(photo_id, now, ttl_secs).await
    }

    /// Issue a fresh hash, superseding any prior one.
    pub async fn rotate(
        &self,
        photo_id: i64,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<PublicHashRecord> {
        let token = generate_token();
        let ts = now.timestamp();
        let row = sqlx::query(
            "INSERT INTO photo_public_hashes (photo_id, hash, rotated_at, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (photo_id) DO UPDATE SET \
               hash = excluded.hash, rotated_at = excluded.rotated_at, \
               expires_at = excluded.expires_at \
             RETURNING id, photo_id, hash, rotated_at, expires_at",
        )
        .bind(photo_id)
        .bind(&token)
        .bind(ts)
        .bind(ts + ttl_secs)
        .fetch_one(self.db.pool())
        .await?;
        row_to_hash(&row)
    }

    /// Drop the hash for a photo (visibility returned to private).
    /// Idempotent.
    pub async fn invalidate(&self, photo_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM photo_public_hashes WHERE photo_id = ?")
            .bind(photo_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Validate a supplied hash. The failure reason is exactly one of
    /// missing, expired or mismatch, checked in that order.
    pub async fn validate(
        &self,
        photo_id: i64,
        supplied: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<HashCheck> {
        let Some(record) = self.get(photo_id).await? else {
            return Ok(HashCheck::Missing);
        };
        if record.expires_at <= now.timestamp() {
            return Ok(HashCheck::Expired);
        }
        match supplied {
            None => Ok(HashCheck::Missing),
            Some(s) if s == record.hash => Ok(HashCheck::Valid),
            Some(_) => Ok(HashCheck::Mismatch),
        }
    }

    /// Hashes due for rotation: expired outright, or older than the rotation
    /// horizon. Only photos that are still public qualify.
    pub async fn rotation_candidates(
        &self,
        now: DateTime<Utc>,
        horizon_secs: i64,
    ) -> Result<Vec<PublicHashRecord>> {
        let ts = now.timestamp();
        let rows = sqlx::query(
            "SELECT h.id, h.photo_id, h.hash, h.rotated_at, h.expires_at \
             FROM photo_public_hashes h \
             JOIN photos p ON p.id = h.photo_id \
             WHERE p.visibility = 'public' \
             AND (h.expires_at <= ? OR h.rotated_at <= ?) \
             ORDER BY h.expires_at ASC",
        )
        .bind(ts)
        .bind(ts - horizon_secs)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_hash).collect()
    }

    /// Public photos with no hash row at all (ensured by the rotation job).
    pub async fn public_photos_without_hash(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT p.id FROM photos p \
             LEFT JOIN photo_public_hashes h ON h.photo_id = p.id \
             WHERE p.visibility = 'public' AND h.id IS NULL \
             ORDER BY p.id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photos::{PhotoRepo, Visibility};
    use crate::projects::ProjectRepo;
    use chrono::TimeZone;

    const DAY: i64 = 86_400;

    async fn fixture() -> (tempfile::TempDir, Db, i64) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), "default").await.unwrap();
        let project = ProjectRepo::new(db.clone()).create("Trip").await.unwrap();
        let photos = PhotoRepo::new(db.clone());
        let photo = photos.upsert_uploaded(project.id, "p.jpg").await.unwrap();
        photos
            .set_visibility(photo.id, Visibility::Public)
            .await
            .unwrap();
        (dir, db, photo.id)
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[tokio::test]
    async fn ensure_is_stable_until_expiry() {
        let (_dir, db, photo_id) = fixture().await;
        let repo = PublicHashRepo::new(db);
        let t0 = at(1_700_000_000);

        let a = repo.ensure(photo_id, t0, 28 * DAY).await.unwrap();
        let b = repo.ensure(photo_id, t0, 28 * DAY).await.unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);

        // Past expiry, ensure issues a fresh token.
        let later = at(1_700_000_000 + 45 * DAY);
        let c = repo.ensure(photo_id, later, 28 * DAY).await.unwrap();
        assert_ne!(a.hash, c.hash);
        assert!(c.expires_at > later.timestamp());
    }

    #[tokio::test]
    async fn validate_reasons_are_exact() {
        let (_dir, db, photo_id) = fixture().await;
        let repo = PublicHashRepo::new(db);
        let t0 = at(1_700_000_000);

        assert_eq!(
            repo.validate(photo_id, Some("x"), t0).await.unwrap(),
            HashCheck::Missing
        );

        let issued = repo.ensure(photo_id, t0, 28 * DAY).await.unwrap();
        assert_eq!(
            repo.validate(photo_id, Some(&issued.hash), t0).await.unwrap(),
            HashCheck::Valid
        );
        assert_eq!(
            repo.validate(photo_id, None, t0).await.unwrap(),
            HashCheck::Missing
        );
        assert_eq!(
            repo.validate(photo_id, Some("nope"), t0).await.unwrap(),
            HashCheck::Mismatch
        );

        let later = at(1_700_000_000 + 45 * DAY);
        assert_eq!(
            repo.validate(photo_id, Some(&issued.hash), later)
                .await
                .unwrap(),
            HashCheck::Expired
        );
    }

    #[tokio::test]
    async fn rotation_candidates_need_public_visibility() {
        let (_dir, db, photo_id) = fixture().await;
        let repo = PublicHashRepo::new(db.clone());
        let t0 = at(1_700_000_000);
        repo.ensure(photo_id, t0, 28 * DAY).await.unwrap();

        // Fresh hash inside the horizon: nothing to rotate.
        let due = repo
            .rotation_candidates(at(t0.timestamp() + DAY), 21 * DAY)
            .await
            .unwrap();
        assert!(due.is_empty());

        // Past the horizon it becomes a candidate.
        let due = repo
            .rotation_candidates(at(t0.timestamp() + 22 * DAY), 21 * DAY)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        // Private photos never rotate; their hash is invalidated instead.
        PhotoRepo::new(db)
            .set_visibility(photo_id, Visibility::Private)
            .await
            .unwrap();
        let due = repo
            .rotation_candidates(at(t0.timestamp() + 45 * DAY), 21 * DAY)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let (_dir, db, photo_id) = fixture().await;
        let repo = PublicHashRepo::new(db);
        repo.ensure(photo_id, at(0), DAY).await.unwrap();

        repo.invalidate(photo_id).await.unwrap();
        repo.invalidate(photo_id).await.unwrap();
        assert!(repo.get(photo_id).await.unwrap().is_none());
    }
}
