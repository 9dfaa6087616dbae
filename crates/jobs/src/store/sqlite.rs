//! SQLite-backed job store.
//!
//! One table (`jobs`) keyed by `job_id`, one column per record field.
//! Payloads are stored as JSON text, timestamps as Unix microseconds.
//!
//! ## Concurrency
//!
//! The database runs in WAL mode so reads proceed while a write is in flight.
//! All writes take a process-wide async lock and run inside a single
//! transaction (read, apply patch, write back), so concurrent updates cannot
//! lose each other and a failed write leaves nothing half-applied.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (unique violation) on insert | `AlreadyExists` |
//! | Any other | `Storage` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use studio_core::{JobId, JobRecord, JobStatus, StatusCounts, now};

use super::{
    JobListing, JobPatch, JobStore, StoreError, clamp_limit, effective_filter, terminal_only,
};

const SELECT_COLUMNS: &str = r#"
    SELECT
        job_id,
        kind,
        status,
        request_json,
        result_json,
        error_text,
        cancel_requested,
        correlation_id,
        created_at,
        started_at,
        finished_at,
        updated_at
    FROM jobs
"#;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id           TEXT PRIMARY KEY NOT NULL,
        kind             TEXT NOT NULL,
        status           TEXT NOT NULL
            CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
        request_json     TEXT NOT NULL,
        result_json      TEXT,
        error_text       TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        correlation_id   TEXT,
        created_at       INTEGER NOT NULL,
        started_at       INTEGER,
        finished_at      INTEGER,
        updated_at       INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_kind ON jobs(kind)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs(updated_at DESC)",
];

/// Durable single-file job store.
#[derive(Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteJobStore {
    /// Open (or create) the database file at `path` and ensure the schema exists.
    ///
    /// Missing parent directories are created.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        debug!(path = %path.display(), "opened job database");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool. Schema creation is idempotent.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id, kind = %record.kind), err)]
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let request_json = encode_json(&record.request_payload)?;
        let result_json = record.result_payload.as_ref().map(encode_json).transpose()?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, kind, status, request_json, result_json, error_text,
                cancel_requested, correlation_id, created_at, started_at,
                finished_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(request_json)
        .bind(result_json)
        .bind(&record.error_text)
        .bind(record.cancel_requested)
        .bind(&record.correlation_id)
        .bind(record.created_at.timestamp_micros())
        .bind(record.started_at.map(|t| t.timestamp_micros()))
        .bind(record.finished_at.map(|t| t.timestamp_micros()))
        .bind(record.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return StoreError::AlreadyExists(record.job_id);
                }
            }
            map_sqlx_error("create", e)
        })?;
        Ok(())
    }

    #[instrument(skip(self, patch), fields(status = ?patch.status), err)]
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} WHERE job_id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update.load", e))?
            .ok_or(StoreError::NotFound(job_id))?;

        let mut record = JobRecord::try_from(row)?;
        // A rejected patch drops `tx`, which rolls back.
        patch.apply(&mut record, now())?;
        let result_json = record.result_payload.as_ref().map(encode_json).transpose()?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, result_json = ?, error_text = ?, cancel_requested = ?,
                started_at = ?, finished_at = ?, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(result_json)
        .bind(&record.error_text)
        .bind(record.cancel_requested)
        .bind(record.started_at.map(|t| t.timestamp_micros()))
        .bind(record.finished_at.map(|t| t.timestamp_micros()))
        .bind(record.updated_at.timestamp_micros())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update.write", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} WHERE job_id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(StoreError::NotFound(job_id))?;
        JobRecord::try_from(row)
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        statuses: Option<&[JobStatus]>,
        limit: usize,
    ) -> Result<JobListing, StoreError> {
        let filter = effective_filter(statuses);
        let sql = match filter {
            Some(s) => format!(
                "{SELECT_COLUMNS} WHERE status IN ({}) ORDER BY updated_at DESC, job_id DESC LIMIT ?",
                placeholders(s.len())
            ),
            None => format!("{SELECT_COLUMNS} ORDER BY updated_at DESC, job_id DESC LIMIT ?"),
        };

        // One read transaction so page and counts come from the same snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for status in filter.unwrap_or_default() {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(clamp_limit(limit) as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        let counts = fetch_counts(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let jobs = rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobListing { jobs, counts })
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_counts(&mut conn).await
    }

    #[instrument(skip(self), err)]
    async fn delete_where(&self, statuses: &[JobStatus]) -> Result<u64, StoreError> {
        let targets = terminal_only(statuses);
        if targets.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM jobs WHERE status IN ({})",
            placeholders(targets.len())
        );
        let mut query = sqlx::query(&sql);
        for status in &targets {
            query = query.bind(status.as_str());
        }

        let _guard = self.write_lock.lock().await;
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_where", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn ids_with_status(&self, status: JobStatus) -> Result<Vec<JobId>, StoreError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT job_id FROM jobs WHERE status = ? ORDER BY created_at ASC, job_id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ids_with_status", e))?;

        ids.into_iter().map(|(id,)| parse_job_id(&id)).collect()
    }
}

async fn fetch_counts(conn: &mut sqlx::SqliteConnection) -> Result<StatusCounts, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        counts.add(parse_status(&status)?, n.max(0) as u64);
    }
    Ok(counts)
}

/// Raw row as stored.
#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    kind: String,
    status: String,
    request_json: String,
    result_json: Option<String>,
    error_text: Option<String>,
    cancel_requested: bool,
    correlation_id: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    updated_at: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let request_payload = serde_json::from_str(&row.request_json)
            .map_err(|e| StoreError::Storage(format!("corrupt request_json for {}: {e}", row.job_id)))?;
        let result_payload = row
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("corrupt result_json for {}: {e}", row.job_id)))?;

        Ok(JobRecord {
            job_id: parse_job_id(&row.job_id)?,
            kind: row.kind,
            status: parse_status(&row.status)?,
            request_payload,
            result_payload,
            error_text: row.error_text,
            cancel_requested: row.cancel_requested,
            correlation_id: row.correlation_id,
            created_at: from_micros(row.created_at)?,
            started_at: row.started_at.map(from_micros).transpose()?,
            finished_at: row.finished_at.map(from_micros).transpose()?,
            updated_at: from_micros(row.updated_at)?,
        })
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, StoreError> {
    Uuid::from_str(raw)
        .map(JobId::from_uuid)
        .map_err(|e| StoreError::Storage(format!("corrupt job_id {raw:?}: {e}")))
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::from_str(raw).map_err(|e| StoreError::Storage(e.to_string()))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Storage(format!("timestamp out of range: {micros}")))
}

fn encode_json(value: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Storage(format!("payload serialization failed: {e}")))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteJobStore {
        SqliteJobStore::open(dir.path().join("nested").join("jobs.db"), Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn job(kind: &str) -> JobRecord {
        JobRecord::queued(
            kind,
            serde_json::json!({"objective": "x", "nested": {"k": [1, 2, 3]}}),
            Some("program-1".to_string()),
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trips_every_field() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let record = job("campaign_run");
        store.create(&record).await.unwrap();

        assert_eq!(store.get(record.job_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn duplicate_id_is_already_exists() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let record = job("k");
        store.create(&record).await.unwrap();

        assert_eq!(
            store.create(&record).await.unwrap_err(),
            StoreError::AlreadyExists(record.job_id)
        );
    }

    #[tokio::test]
    async fn lifecycle_updates_persist() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let record = job("k");
        store.create(&record).await.unwrap();

        let running = store.update(record.job_id, JobPatch::start()).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        let done = store
            .update(record.job_id, JobPatch::complete(serde_json::json!({"score": 0.9})))
            .await
            .unwrap();

        let loaded = store.get(record.job_id).await.unwrap();
        assert_eq!(loaded, done);
        assert_eq!(loaded.result_payload, Some(serde_json::json!({"score": 0.9})));
        assert!(loaded.started_at.is_some() && loaded.finished_at.is_some());

        let err = store
            .update(record.job_id, JobPatch::fail("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { status: JobStatus::Completed, .. }));
        assert_eq!(store.get(record.job_id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = JobId::new();
        assert_eq!(
            store.update(id, JobPatch::start()).await.unwrap_err(),
            StoreError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_and_counts_unfiltered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut ids = Vec::new();
        for i in 0..4 {
            let record = job(&format!("k{i}"));
            ids.push(record.job_id);
            store.create(&record).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.update(ids[0], JobPatch::start()).await.unwrap();

        let all = store.list(None, 100).await.unwrap();
        assert_eq!(all.jobs.len(), 4);
        assert_eq!(all.jobs[0].job_id, ids[0]);
        for pair in all.jobs.windows(2) {
            assert!(pair[0].updated_at >= pair[1].updated_at);
        }

        let queued = store.list(Some(&[JobStatus::Queued][..]), 2).await.unwrap();
        assert_eq!(queued.jobs.len(), 2);
        assert!(queued.jobs.iter().all(|j| j.status == JobStatus::Queued));
        assert_eq!(queued.counts.queued, 3);
        assert_eq!(queued.counts.running, 1);

        // Limits are clamped to at least one record.
        assert_eq!(store.list(None, 0).await.unwrap().jobs.len(), 1);
    }

    #[tokio::test]
    async fn delete_where_excludes_active_statuses() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let finished = job("finished");
        let active = job("active");
        store.create(&finished).await.unwrap();
        store.create(&active).await.unwrap();
        store.update(finished.job_id, JobPatch::start()).await.unwrap();
        store
            .update(finished.job_id, JobPatch::fail("boom"))
            .await
            .unwrap();
        store.update(active.job_id, JobPatch::start()).await.unwrap();

        let removed = store
            .delete_where(&[JobStatus::Failed, JobStatus::Running, JobStatus::Queued])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.get(finished.job_id).await.unwrap_err(),
            StoreError::NotFound(finished.job_id)
        );
        assert_eq!(store.get(active.job_id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn reopening_keeps_history_and_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let record = job("durable");
        {
            let store = open_store(&dir).await;
            store.create(&record).await.unwrap();
            store.close().await;
        }

        let store = open_store(&dir).await;
        assert_eq!(store.get(record.job_id).await.unwrap(), record);
        assert_eq!(
            store.ids_with_status(JobStatus::Queued).await.unwrap(),
            vec![record.job_id]
        );
        assert_eq!(store.counts().await.unwrap().queued, 1);
    }
}
