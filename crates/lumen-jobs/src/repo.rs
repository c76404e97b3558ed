//! Typed CRUD over `jobs` and `job_items`.
//!
//! This repository is the only writer of job state. Every transition goes
//! through a guarded UPDATE so races resolve in the database: a claim that
//! loses affects zero rows and returns `None`, a second terminal transition
//! affects zero rows and reports `false`.

use std::str::FromStr;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use lumen_store::{now_ts, Db};

use crate::{
    ItemStatus, JobError, JobItemRecord, JobRecord, JobScope, JobStatus, JobType, Result,
    ERROR_MESSAGE_MAX, MAX_ITEMS_PER_JOB,
};

const JOB_COLS: &str = "id, tenant_id, project_id, type, status, priority, scope, created_at, \
     started_at, finished_at, heartbeat_at, worker_id, progress_done, progress_total, attempts, \
     max_attempts, last_error_at, error_message, payload";

const ITEM_COLS: &str = "id, job_id, photo_id, filename, status, message, created_at, updated_at";

fn row_to_job(row: &SqliteRow) -> Result<JobRecord> {
    let job_type: String = row.try_get("type").map_err(lumen_store::StoreError::from)?;
    let status: String = row.try_get("status").map_err(lumen_store::StoreError::from)?;
    let scope: String = row.try_get("scope").map_err(lumen_store::StoreError::from)?;
    let payload: Option<String> = row
        .try_get("payload")
        .map_err(lumen_store::StoreError::from)?;

    let get = |e: sqlx::Error| JobError::Store(e.into());
    Ok(JobRecord {
        id: row.try_get("id").map_err(get)?,
        tenant_id: row.try_get("tenant_id").map_err(get)?,
        project_id: row.try_get("project_id").map_err(get)?,
        job_type: JobType::from_str(&job_type)?,
        status: JobStatus::from_str(&status)?,
        priority: row.try_get("priority").map_err(get)?,
        scope: JobScope::from_str(&scope)?,
        created_at: row.try_get("created_at").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        finished_at: row.try_get("finished_at").map_err(get)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(get)?,
        worker_id: row.try_get("worker_id").map_err(get)?,
        progress_done: row.try_get("progress_done").map_err(get)?,
        progress_total: row.try_get("progress_total").map_err(get)?,
        attempts: row.try_get("attempts").map_err(get)?,
        max_attempts: row.try_get("max_attempts").map_err(get)?,
        last_error_at: row.try_get("last_error_at").map_err(get)?,
        error_message: row.try_get("error_message").map_err(get)?,
        payload: payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_item(row: &SqliteRow) -> Result<JobItemRecord> {
    let status: String = row.try_get("status").map_err(lumen_store::StoreError::from)?;
    let get = |e: sqlx::Error| JobError::Store(e.into());
    Ok(JobItemRecord {
        id: row.try_get("id").map_err(get)?,
        job_id: row.try_get("job_id").map_err(get)?,
        photo_id: row.try_get("photo_id").map_err(get)?,
        filename: row.try_get("filename").map_err(get)?,
        status: ItemStatus::from_str(&status)?,
        message: row.try_get("message").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn payload_to_column(payload: &serde_json::Value) -> Option<String> {
    match payload {
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub scope: JobScope,
    pub priority: i64,
    pub project_id: Option<i64>,
    pub payload: serde_json::Value,
    pub progress_total: Option<i64>,
    pub max_attempts: Option<i64>,
}

impl NewJob {
    pub fn new(job_type: JobType, scope: JobScope) -> Self {
        Self {
            job_type,
            scope,
            priority: 50,
            project_id: None,
            payload: serde_json::Value::Null,
            progress_total: None,
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, n: i64) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

/// A new per-job subtask.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub photo_id: Option<i64>,
    pub filename: Option<String>,
}

impl NewItem {
    pub fn filename(name: impl Into<String>) -> Self {
        Self {
            photo_id: None,
            filename: Some(name.into()),
        }
    }

    pub fn photo(photo_id: i64, name: impl Into<String>) -> Self {
        Self {
            photo_id: Some(photo_id),
            filename: Some(name.into()),
        }
    }
}

/// Lane and tenant predicates for a claim attempt.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub worker_id: String,
    pub tenant: Option<String>,
    pub min_priority: Option<i64>,
    pub max_priority: Option<i64>,
}

/// Filters for job listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project_id: Option<i64>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregated item counts for one job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ItemsSummary {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct JobsRepository {
    db: Db,
}

impl JobsRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Insert a queued job and return it.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobRecord> {
        let now = now_ts();
        let done = sqlx::query(
            "INSERT INTO jobs (tenant_id, project_id, type, status, priority, scope, \
             created_at, progress_total, max_attempts, payload) \
             VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.db.tenant())
        .bind(new.project_id)
        .bind(new.job_type.to_string())
        .bind(new.priority)
        .bind(new.scope.to_string())
        .bind(now)
        .bind(new.progress_total)
        .bind(new.max_attempts)
        .bind(payload_to_column(&new.payload))
        .execute(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;

        let job = self.get(done.last_insert_rowid()).await?;
        tracing::debug!(job_id = job.id, job_type = %job.job_type, priority = job.priority, "enqueued job");
        Ok(job)
    }

    /// Insert a job together with its items, atomically. Batches over the
    /// item cap fail with [`JobError::BatchTooLarge`] unless `auto_chunk`
    /// splits them into sibling jobs carrying `chunk_index`/`total_chunks`.
    pub async fn enqueue_with_items(
        &self,
        new: NewJob,
        items: Vec<NewItem>,
        auto_chunk: bool,
    ) -> Result<Vec<JobRecord>> {
        if items.len() > MAX_ITEMS_PER_JOB && !auto_chunk {
            return Err(JobError::BatchTooLarge {
                got: items.len(),
                max: MAX_ITEMS_PER_JOB,
            });
        }

        let chunks: Vec<&[NewItem]> = if items.is_empty() {
            vec![&items[..]]
        } else {
            items.chunks(MAX_ITEMS_PER_JOB).collect()
        };
        let total_chunks = chunks.len();
        let mut jobs = Vec::with_capacity(total_chunks);

        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            let mut payload = match new.payload.clone() {
                serde_json::Value::Object(map) => map,
                serde_json::Value::Null => serde_json::Map::new(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("payload".into(), other);
                    map
                }
            };
            if total_chunks > 1 {
                payload.insert("chunk_index".into(), (chunk_index as i64).into());
                payload.insert("total_chunks".into(), (total_chunks as i64).into());
            }
            let payload = if payload.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::Object(payload)
            };

            let job_id = self
                .insert_job_with_items_tx(&new, payload, chunk)
                .await?;
            jobs.push(self.get(job_id).await?);
        }
        Ok(jobs)
    }

    async fn insert_job_with_items_tx(
        &self,
        new: &NewJob,
        payload: serde_json::Value,
        items: &[NewItem],
    ) -> Result<i64> {
        let now = now_ts();
        let tenant = self.db.tenant().to_string();
        let new = new.clone();
        let items = items.to_vec();

        let job_id = self
            .db
            .with_tx(move |conn| {
                Box::pin(async move {
                    let done = sqlx::query(
                        "INSERT INTO jobs (tenant_id, project_id, type, status, priority, scope, \
                         created_at, progress_total, max_attempts, payload) \
                         VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&tenant)
                    .bind(new.project_id)
                    .bind(new.job_type.to_string())
                    .bind(new.priority)
                    .bind(new.scope.to_string())
                    .bind(now)
                    .bind(items.len() as i64)
                    .bind(new.max_attempts)
                    .bind(payload_to_column(&payload))
                    .execute(&mut *conn)
                    .await?;
                    let job_id = done.last_insert_rowid();

                    for item in &items {
                        sqlx::query(
                            "INSERT INTO job_items (job_id, photo_id, filename, status, \
                             created_at, updated_at) VALUES (?, ?, ?, 'pending', ?, ?)",
                        )
                        .bind(job_id)
                        .bind(item.photo_id)
                        .bind(&item.filename)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(job_id)
                })
            })
            .await?;
        Ok(job_id)
    }

    /// Two-step claim: pick the best candidate, then take it with a guarded
    /// UPDATE. Losing the race affects zero rows and yields `None`, so
    /// contending workers make wait-free progress without row locks.
    pub async fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<JobRecord>> {
        let key = format!(
            "jobs:claimSelect:{}:{}:{}",
            filter.tenant.is_some(),
            filter.min_priority.is_some(),
            filter.max_priority.is_some()
        );
        let sql = self.db.statements().sql(&key, || {
            let mut sql = String::from("SELECT id FROM jobs WHERE status = 'queued'");
            if filter.tenant.is_some() {
                sql.push_str(" AND tenant_id = ?");
            }
            if filter.min_priority.is_some() {
                sql.push_str(" AND priority >= ?");
            }
            if filter.max_priority.is_some() {
                sql.push_str(" AND priority <= ?");
            }
            sql.push_str(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1");
            sql
        })?;

        let mut query = sqlx::query(&sql);
        if let Some(tenant) = &filter.tenant {
            query = query.bind(tenant);
        }
        if let Some(min) = filter.min_priority {
            query = query.bind(min);
        }
        if let Some(max) = filter.max_priority {
            query = query.bind(max);
        }
        let candidate = query
            .fetch_optional(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let now = now_ts();

        let done = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, heartbeat_at = ?, \
             worker_id = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(now)
        .bind(&filter.worker_id)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;

        if done.rows_affected() == 0 {
            // Another worker won the race.
            return Ok(None);
        }
        Ok(Some(self.get(id).await?))
    }

    pub async fn get(&self, id: i64) -> Result<JobRecord> {
        self.try_get(id).await?.ok_or(JobError::NotFound(id))
    }

    pub async fn try_get(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Refresh the heartbeat. Silent no-op unless the job is running.
    pub async fn heartbeat(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status = 'running'")
            .bind(now_ts())
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        id: i64,
        done: Option<i64>,
        total: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET progress_done = COALESCE(?, progress_done), \
             progress_total = COALESCE(?, progress_total) WHERE id = ?",
        )
        .bind(done)
        .bind(total)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(())
    }

    pub async fn update_payload(&self, id: i64, payload: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET payload = ? WHERE id = ?")
            .bind(payload_to_column(payload))
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        Ok(())
    }

    /// Merge object fields into the payload. Only the owning worker writes a
    /// running job's payload, so read-modify-write is race-free.
    pub async fn merge_payload(
        &self,
        id: i64,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let job = self.get(id).await?;
        let mut map = match job.payload {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.extend(patch);
        let merged = serde_json::Value::Object(map);
        self.update_payload(id, &merged).await?;
        Ok(merged)
    }

    async fn terminal_transition(
        &self,
        id: i64,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let now = now_ts();
        let truncated = error_message.map(|m| {
            let mut m = m.to_string();
            if m.len() > ERROR_MESSAGE_MAX {
                m.truncate(
                    (0..=ERROR_MESSAGE_MAX)
                        .rev()
                        .find(|i| m.is_char_boundary(*i))
                        .unwrap_or(0),
                );
            }
            m
        });
        let done = sqlx::query(
            "UPDATE jobs SET status = ?, finished_at = ?, \
             last_error_at = CASE WHEN ? IS NULL THEN last_error_at ELSE ? END, \
             error_message = COALESCE(?, error_message) \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.to_string())
        .bind(now)
        .bind(&truncated)
        .bind(now)
        .bind(&truncated)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(done.rows_affected() > 0)
    }

    /// Transition to `completed`. Returns `false` when the job was already
    /// terminal (e.g. canceled while running).
    pub async fn complete(&self, id: i64) -> Result<bool> {
        self.terminal_transition(id, JobStatus::Completed, None).await
    }

    pub async fn fail(&self, id: i64, message: &str) -> Result<bool> {
        self.terminal_transition(id, JobStatus::Failed, Some(message))
            .await
    }

    pub async fn cancel(&self, id: i64) -> Result<bool> {
        self.terminal_transition(id, JobStatus::Canceled, None).await
    }

    /// Cancel every non-terminal job for a project. Sibling chunks scoped to
    /// other projects are left alone.
    pub async fn cancel_by_project(&self, project_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'canceled', finished_at = ? \
             WHERE project_id = ? AND status IN ('queued', 'running') RETURNING id",
        )
        .bind(now_ts())
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    /// Put a running job back in the queue with run fields cleared.
    /// Attempts are preserved.
    pub async fn requeue(&self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'queued', started_at = NULL, heartbeat_at = NULL, \
             worker_id = NULL WHERE id = ? AND status = 'running'",
        )
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(done.rows_affected() > 0)
    }

    /// Record a transient failure without changing status.
    pub async fn record_error(&self, id: i64, message: &str) -> Result<()> {
        let mut message = message.to_string();
        if message.len() > ERROR_MESSAGE_MAX {
            message.truncate(
                (0..=ERROR_MESSAGE_MAX)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0),
            );
        }
        sqlx::query("UPDATE jobs SET last_error_at = ?, error_message = ? WHERE id = ?")
            .bind(now_ts())
            .bind(message)
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        Ok(())
    }

    pub async fn increment_attempts(&self, id: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE jobs SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        )
        .bind(id)
        .fetch_one(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(row.get("attempts"))
    }

    /// Fill in `max_attempts` for jobs enqueued without one.
    pub async fn set_default_max_attempts(&self, id: i64, n: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET max_attempts = ? WHERE id = ? AND max_attempts IS NULL")
            .bind(n)
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        Ok(())
    }

    /// Requeue running jobs whose heartbeat is older than `stale_seconds`.
    /// Attempts stay untouched; the jobs re-enter normal scheduling.
    pub async fn requeue_stale_running(&self, stale_seconds: i64) -> Result<Vec<i64>> {
        let cutoff = now_ts() - stale_seconds;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'queued', started_at = NULL, heartbeat_at = NULL, \
             worker_id = NULL WHERE status = 'running' AND heartbeat_at < ? RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("id")).collect();
        if !ids.is_empty() {
            tracing::warn!(?ids, stale_seconds, "requeued stale running jobs");
        }
        Ok(ids)
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<JobRecord>> {
        let key = format!(
            "jobs:list:{}:{}:{}",
            filter.project_id.is_some(),
            filter.status.is_some(),
            filter.job_type.is_some()
        );
        let sql = self.db.statements().sql(&key, || {
            let mut sql = format!("SELECT {JOB_COLS} FROM jobs WHERE tenant_id = ?");
            if filter.project_id.is_some() {
                sql.push_str(" AND project_id = ?");
            }
            if filter.status.is_some() {
                sql.push_str(" AND status = ?");
            }
            if filter.job_type.is_some() {
                sql.push_str(" AND type = ?");
            }
            sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
            sql
        })?;

        let mut query = sqlx::query(&sql).bind(self.db.tenant());
        if let Some(project_id) = filter.project_id {
            query = query.bind(project_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(job_type) = filter.job_type {
            query = query.bind(job_type.to_string());
        }
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let rows = query
            .bind(limit)
            .bind(filter.offset.max(0))
            .fetch_all(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn list_items(&self, job_id: i64) -> Result<Vec<JobItemRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLS} FROM job_items WHERE job_id = ? ORDER BY id ASC"
        ))
        .bind(job_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn next_pending_item(&self, job_id: i64) -> Result<Option<JobItemRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLS} FROM job_items WHERE job_id = ? AND status = 'pending' \
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        row.as_ref().map(row_to_item).transpose()
    }

    /// Update one item and keep the parent job's `progress_done` equal to
    /// the count of finished items, in one transaction.
    pub async fn update_item_status(
        &self,
        item_id: i64,
        status: ItemStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        let message = message.map(|m| m.to_string());
        self.db
            .with_tx(move |conn| {
                Box::pin(async move {
                    let row = sqlx::query("SELECT job_id FROM job_items WHERE id = ?")
                        .bind(item_id)
                        .fetch_one(&mut *conn)
                        .await?;
                    let job_id: i64 = row.get("job_id");

                    sqlx::query(
                        "UPDATE job_items SET status = ?, message = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(status.to_string())
                    .bind(&message)
                    .bind(now)
                    .bind(item_id)
                    .execute(&mut *conn)
                    .await?;

                    sqlx::query(
                        "UPDATE jobs SET progress_done = (SELECT COUNT(*) FROM job_items \
                         WHERE job_id = ? AND status IN ('done', 'failed')) WHERE id = ?",
                    )
                    .bind(job_id)
                    .bind(job_id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    /// Reclassify items interrupted mid-run, after a cancellation.
    pub async fn fail_running_items(&self, job_id: i64, message: &str) -> Result<u64> {
        let now = now_ts();
        let message = message.to_string();
        let count = self
            .db
            .with_tx(move |conn| {
                Box::pin(async move {
                    let done = sqlx::query(
                        "UPDATE job_items SET status = 'failed', message = ?, updated_at = ? \
                         WHERE job_id = ? AND status = 'running'",
                    )
                    .bind(&message)
                    .bind(now)
                    .bind(job_id)
                    .execute(&mut *conn)
                    .await?;

                    sqlx::query(
                        "UPDATE jobs SET progress_done = (SELECT COUNT(*) FROM job_items \
                         WHERE job_id = ? AND status IN ('done', 'failed')) WHERE id = ?",
                    )
                    .bind(job_id)
                    .bind(job_id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(done.rows_affected())
                })
            })
            .await?;
        Ok(count)
    }

    pub async fn items_summary(&self, job_id: i64) -> Result<ItemsSummary> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending, \
                SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END) AS running, \
                SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END) AS done, \
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed \
             FROM job_items WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(ItemsSummary {
            total: row.get("total"),
            pending: row.try_get("pending").unwrap_or(0),
            running: row.try_get("running").unwrap_or(0),
            done: row.try_get("done").unwrap_or(0),
            failed: row.try_get("failed").unwrap_or(0),
        })
    }

    /// Whether a successor of `job_type` derived from `predecessor_id` was
    /// ever enqueued. Keys successor dedup under retries.
    pub async fn exists_successor(&self, job_type: JobType, predecessor_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE type = ? \
             AND json_extract(payload, '$.predecessor_id') = ?",
        )
        .bind(job_type.to_string())
        .bind(predecessor_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Successor dedup narrowed to a project, for predecessors that spawn
    /// one successor per project (a move reconciling several sources).
    pub async fn exists_successor_scoped(
        &self,
        job_type: JobType,
        predecessor_id: i64,
        project_id: Option<i64>,
    ) -> Result<bool> {
        let key = format!("jobs:existsSuccessor:{}", project_id.is_some());
        let sql = self.db.statements().sql(&key, || {
            let mut sql = String::from(
                "SELECT COUNT(*) AS n FROM jobs WHERE type = ? \
                 AND json_extract(payload, '$.predecessor_id') = ?",
            );
            if project_id.is_some() {
                sql.push_str(" AND project_id = ?");
            }
            sql
        })?;
        let mut query = sqlx::query(&sql)
            .bind(job_type.to_string())
            .bind(predecessor_id);
        if let Some(project_id) = project_id {
            query = query.bind(project_id);
        }
        let row = query
            .fetch_one(self.db.pool())
            .await
            .map_err(lumen_store::StoreError::from)?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Whether any queued or running job of `job_type` exists for the
    /// tenant. Keeps maintenance jobs singular.
    pub async fn exists_active_of_type(&self, job_type: JobType) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE tenant_id = ? AND type = ? \
             AND status IN ('queued', 'running')",
        )
        .bind(self.db.tenant())
        .bind(job_type.to_string())
        .fetch_one(self.db.pool())
        .await
        .map_err(lumen_store::StoreError::from)?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lumen_store::Db;

    async fn fixture() -> (tempfile::TempDir, JobsRepository) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), "default").await.unwrap();
        (dir, JobsRepository::new(db))
    }

    fn claim(worker: &str) -> ClaimFilter {
        ClaimFilter {
            worker_id: worker.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_and_claim_sets_run_fields() {
        let (_dir, repo) = fixture().await;
        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Project).priority(50))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);

        let claimed = repo.claim_next(&claim("w1")).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
        assert!(claimed.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn claim_order_is_priority_desc_then_fifo() {
        let (_dir, repo) = fixture().await;
        let a = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant).priority(50))
            .await
            .unwrap();
        let b = repo
            .enqueue(NewJob::new(JobType::RevertChanges, JobScope::Tenant).priority(90))
            .await
            .unwrap();
        let c = repo
            .enqueue(NewJob::new(JobType::ManifestCheck, JobScope::Tenant).priority(50))
            .await
            .unwrap();

        let order: Vec<i64> = [
            repo.claim_next(&claim("w")).await.unwrap().unwrap().id,
            repo.claim_next(&claim("w")).await.unwrap().unwrap().id,
            repo.claim_next(&claim("w")).await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![b.id, a.id, c.id]);
        assert!(repo.claim_next(&claim("w")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lane_filters_bound_priorities() {
        let (_dir, repo) = fixture().await;
        repo.enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant).priority(50))
            .await
            .unwrap();
        let high = repo
            .enqueue(NewJob::new(JobType::ImageMove, JobScope::Tenant).priority(80))
            .await
            .unwrap();

        let mut filter = claim("prio");
        filter.min_priority = Some(70);
        let got = repo.claim_next(&filter).await.unwrap().unwrap();
        assert_eq!(got.id, high.id);
        assert!(repo.claim_next(&filter).await.unwrap().is_none());

        let mut filter = claim("norm");
        filter.max_priority = Some(69);
        assert!(repo.claim_next(&filter).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_yield_one_winner() {
        let (_dir, repo) = fixture().await;
        repo.enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();

        let r1 = repo.clone();
        let r2 = repo.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.claim_next(&claim("w1")).await.unwrap() }),
            tokio::spawn(async move { r2.claim_next(&claim("w2")).await.unwrap() }),
        );
        let wins = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| r.is_some())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn terminal_transitions_happen_once() {
        let (_dir, repo) = fixture().await;
        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.claim_next(&claim("w")).await.unwrap().unwrap();

        assert!(repo.complete(job.id).await.unwrap());
        assert!(!repo.fail(job.id, "late").await.unwrap());
        assert!(!repo.cancel(job.id).await.unwrap());

        let job = repo.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn fail_truncates_long_messages() {
        let (_dir, repo) = fixture().await;
        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.claim_next(&claim("w")).await.unwrap().unwrap();

        let long = "x".repeat(5000);
        repo.fail(job.id, &long).await.unwrap();
        let job = repo.get(job.id).await.unwrap();
        assert_eq!(job.error_message.unwrap().len(), crate::ERROR_MESSAGE_MAX);
        assert!(job.last_error_at.is_some());
    }

    #[tokio::test]
    async fn batch_chunking_splits_at_the_cap() {
        let (_dir, repo) = fixture().await;
        let items: Vec<NewItem> = (0..5000)
            .map(|i| NewItem::filename(format!("f{i}.jpg")))
            .collect();

        let err = repo
            .enqueue_with_items(
                NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet),
                items.clone(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::BatchTooLarge { got: 5000, .. }));

        let jobs = repo
            .enqueue_with_items(
                NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet),
                items,
                true,
            )
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        let totals: Vec<i64> = jobs.iter().map(|j| j.progress_total.unwrap()).collect();
        assert_eq!(totals, vec![2000, 2000, 1000]);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(
                job.payload_field("chunk_index").unwrap().as_i64(),
                Some(i as i64)
            );
            assert_eq!(
                job.payload_field("total_chunks").unwrap().as_i64(),
                Some(3)
            );
        }
    }

    #[tokio::test]
    async fn item_updates_keep_progress_consistent() {
        let (_dir, repo) = fixture().await;
        let jobs = repo
            .enqueue_with_items(
                NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet),
                vec![
                    NewItem::filename("a.jpg"),
                    NewItem::filename("b.jpg"),
                    NewItem::filename("c.jpg"),
                ],
                false,
            )
            .await
            .unwrap();
        let job = &jobs[0];
        assert_eq!(job.progress_total, Some(3));

        let first = repo.next_pending_item(job.id).await.unwrap().unwrap();
        repo.update_item_status(first.id, ItemStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(repo.get(job.id).await.unwrap().progress_done, 0);

        repo.update_item_status(first.id, ItemStatus::Done, None)
            .await
            .unwrap();
        let second = repo.next_pending_item(job.id).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        repo.update_item_status(second.id, ItemStatus::Failed, Some("bad file"))
            .await
            .unwrap();

        let job = repo.get(job.id).await.unwrap();
        assert_eq!(job.progress_done, 2);

        let summary = repo.items_summary(job.id).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
    }

    #[tokio::test]
    async fn stale_requeue_selects_only_silent_jobs() {
        let (_dir, repo) = fixture().await;
        let stale = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        let fresh = repo
            .enqueue(NewJob::new(JobType::RevertChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.claim_next(&claim("w1")).await.unwrap().unwrap();
        repo.claim_next(&claim("w2")).await.unwrap().unwrap();

        // Freeze w1's heartbeat far in the past.
        sqlx::query("UPDATE jobs SET heartbeat_at = heartbeat_at - 120 WHERE id = ?")
            .bind(stale.id)
            .execute(repo.db().pool())
            .await
            .unwrap();

        let ids = repo.requeue_stale_running(60).await.unwrap();
        assert_eq!(ids, vec![stale.id]);

        let requeued = repo.get(stale.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.attempts, 0);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.heartbeat_at.is_none());

        assert_eq!(repo.get(fresh.id).await.unwrap().status, JobStatus::Running);

        // A fresh claim picks the requeued job back up.
        let mut filter = claim("w3");
        filter.max_priority = Some(69);
        let reclaimed = repo.claim_next(&filter).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, stale.id);
        assert_eq!(reclaimed.attempts, 0);
    }

    #[tokio::test]
    async fn stale_requeue_ignores_canceled_jobs() {
        let (_dir, repo) = fixture().await;
        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.claim_next(&claim("w")).await.unwrap().unwrap();
        repo.cancel(job.id).await.unwrap();

        let ids = repo.requeue_stale_running(0).await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(repo.get(job.id).await.unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_by_project_spares_other_projects() {
        let (_dir, repo) = fixture().await;
        let p1 = 1001;
        let p2 = 1002;
        // jobs.project_id references projects, so the rows must exist.
        sqlx::query(
            "INSERT INTO projects (id, tenant_id, folder, name, created_at, updated_at) \
             VALUES (1001, 'default', 'a', 'A', 0, 0), (1002, 'default', 'b', 'B', 0, 0)",
        )
        .execute(repo.db().pool())
        .await
        .unwrap();

        let a = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Project).project(p1))
            .await
            .unwrap();
        let b = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Project).project(p2))
            .await
            .unwrap();

        let ids = repo.cancel_by_project(p1).await.unwrap();
        assert_eq!(ids, vec![a.id]);
        assert_eq!(repo.get(a.id).await.unwrap().status, JobStatus::Canceled);
        assert_eq!(repo.get(b.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn heartbeat_is_noop_unless_running() {
        let (_dir, repo) = fixture().await;
        let job = repo
            .enqueue(NewJob::new(JobType::CommitChanges, JobScope::Tenant))
            .await
            .unwrap();
        repo.heartbeat(job.id).await.unwrap();
        assert!(repo.get(job.id).await.unwrap().heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn successor_dedup_is_keyed_on_predecessor() {
        let (_dir, repo) = fixture().await;
        assert!(!repo
            .exists_successor(JobType::GenerateDerivatives, 42)
            .await
            .unwrap());

        repo.enqueue(
            NewJob::new(JobType::GenerateDerivatives, JobScope::PhotoSet)
                .payload(serde_json::json!({ "predecessor_id": 42 })),
        )
        .await
        .unwrap();

        assert!(repo
            .exists_successor(JobType::GenerateDerivatives, 42)
            .await
            .unwrap());
        assert!(!repo
            .exists_successor(JobType::ManifestCheck, 42)
            .await
            .unwrap());
    }
}
