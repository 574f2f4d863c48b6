//! SQLite-backed `JobStore` (spec §4.1), grounded on the WAL-mode SQLite
//! backend used elsewhere in this codebase: open-or-create, migrate, pool
//! with a bounded connection count. Logs live in their own table so a ring-
//! capped append never requires reading or rewriting the whole job row.

use super::{JobFilter, JobPage, JobStore};
use crate::error::EngineError;
use crate::model::{Job, JobError, JobProgress, JobStatus, LogEntry, LogRing, LOG_CAP};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::str::FromStr;

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens (creating if absent) the database at `path`, runs migrations,
    /// and returns a store backed by a small connection pool in WAL mode.
    pub async fn open(path: &str) -> Result<Self, EngineError> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url)
                .await
                .map_err(|e| EngineError::Storage(format!("failed to create database: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| EngineError::Storage(format!("invalid database url: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to connect: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EngineError::Storage(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn logs_for(&self, job_id: &str) -> Result<LogRing, EngineError> {
        let rows = sqlx::query("SELECT entry FROM job_logs WHERE job_id = ? ORDER BY seq ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut logs = LogRing::default();
        for row in rows {
            let raw: String = row
                .try_get("entry")
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            let entry: LogEntry = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Storage(format!("corrupt log entry: {e}")))?;
            logs.push(entry);
        }
        Ok(logs)
    }

    fn row_to_job(row: &SqliteRow) -> Result<(Job, bool), EngineError> {
        let status_str: String = row
            .try_get("status")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let status = serde_json::from_value(serde_json::Value::String(status_str))
            .map_err(|e| EngineError::Storage(format!("corrupt status: {e}")))?;

        let source_meta_raw: String = row
            .try_get("source_meta")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let config_raw: String = row
            .try_get("config")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let progress_raw: String = row
            .try_get("progress")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let paths_raw: String = row
            .try_get("paths")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let output_file_raw: Option<String> = row
            .try_get("output_file")
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let error_raw: Option<String> = row
            .try_get("error")
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let job = Job {
            id: row.try_get("id").map_err(|e| EngineError::Storage(e.to_string()))?,
            status,
            created_at: row
                .try_get("created_at")
                .map_err(|e| EngineError::Storage(e.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| EngineError::Storage(e.to_string()))?,
            source_ref: row
                .try_get("source_ref")
                .map_err(|e| EngineError::Storage(e.to_string()))?,
            source_meta: serde_json::from_str(&source_meta_raw)
                .map_err(|e| EngineError::Storage(format!("corrupt source_meta: {e}")))?,
            config: serde_json::from_str(&config_raw)
                .map_err(|e| EngineError::Storage(format!("corrupt config: {e}")))?,
            progress: serde_json::from_str(&progress_raw)
                .map_err(|e| EngineError::Storage(format!("corrupt progress: {e}")))?,
            paths: serde_json::from_str(&paths_raw)
                .map_err(|e| EngineError::Storage(format!("corrupt paths: {e}")))?,
            output_file: output_file_raw.map(std::path::PathBuf::from),
            error: error_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| EngineError::Storage(format!("corrupt error: {e}")))?,
        };
        Ok((job, false))
    }

    async fn fetch_one_with_logs(&self, id: &str) -> Result<Option<Job>, EngineError> {
        let row = sqlx::query(
            "SELECT id, status, created_at, updated_at, source_ref, source_meta, config,
                    progress, paths, output_file, error
             FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let (mut job, _) = Self::row_to_job(&row)?;
        job.progress.logs = self.logs_for(id).await?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: Job) -> Result<(), EngineError> {
        let status_json = serde_json::to_value(job.status)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let status_str = status_json.as_str().unwrap_or("pending").to_string();

        let result = sqlx::query(
            "INSERT INTO jobs
                (id, status, created_at, updated_at, source_ref, source_meta, config,
                 progress, paths, output_file, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(status_str)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.source_ref)
        .bind(serde_json::to_string(&job.source_meta).map_err(|e| EngineError::Storage(e.to_string()))?)
        .bind(serde_json::to_string(&job.config).map_err(|e| EngineError::Storage(e.to_string()))?)
        .bind(serde_json::to_string(&job.progress).map_err(|e| EngineError::Storage(e.to_string()))?)
        .bind(serde_json::to_string(&job.paths).map_err(|e| EngineError::Storage(e.to_string()))?)
        .bind(job.output_file.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(job.error.as_ref().map(serde_json::to_string).transpose().map_err(|e| EngineError::Storage(e.to_string()))?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(EngineError::Duplicate),
            Err(e) => Err(EngineError::Storage(e.to_string())),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, EngineError> {
        self.fetch_one_with_logs(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool, EngineError> {
        let row = sqlx::query("SELECT 1 as present FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn delete(&self, id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, filter: JobFilter) -> Result<JobPage, EngineError> {
        let status_str = filter
            .status
            .map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string());

        let total: i64 = if let Some(ref s) = status_str {
            sqlx::query("SELECT COUNT(*) as c FROM jobs WHERE status = ?")
                .bind(s)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .try_get("c")
                .map_err(|e| EngineError::Storage(e.to_string()))?
        } else {
            sqlx::query("SELECT COUNT(*) as c FROM jobs")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .try_get("c")
                .map_err(|e| EngineError::Storage(e.to_string()))?
        };

        let limit = if filter.limit == 0 { total.max(0) as i64 } else { filter.limit as i64 };

        let rows = if let Some(ref s) = status_str {
            sqlx::query(
                "SELECT id, status, created_at, updated_at, source_ref, source_meta, config,
                        progress, paths, output_file, error
                 FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(s)
            .bind(limit)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT id, status, created_at, updated_at, source_ref, source_meta, config,
                        progress, paths, output_file, error
                 FROM jobs ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(limit)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let (job, _) = Self::row_to_job(row)?;
            jobs.push(job);
        }

        let has_more = (filter.offset as i64 + jobs.len() as i64) < total;
        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
            has_more,
        })
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<u64, EngineError> {
        let count: i64 = if let Some(s) = status {
            let s = serde_json::to_value(s).unwrap().as_str().unwrap().to_string();
            sqlx::query("SELECT COUNT(*) as c FROM jobs WHERE status = ?")
                .bind(s)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .try_get("c")
                .map_err(|e| EngineError::Storage(e.to_string()))?
        } else {
            sqlx::query("SELECT COUNT(*) as c FROM jobs")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .try_get("c")
                .map_err(|e| EngineError::Storage(e.to_string()))?
        };
        Ok(count.max(0) as u64)
    }

    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<(), EngineError> {
        let raw = serde_json::to_string(progress).map_err(|e| EngineError::Storage(e.to_string()))?;
        let result = sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(raw)
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    /// Appends one log row and, in the same transaction, evicts rows past
    /// `LOG_CAP` by sequence number — an atomic ring-cap that never reads the
    /// full log back to enforce the cap.
    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), EngineError> {
        if sqlx::query("SELECT 1 as present FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .is_none()
        {
            return Err(EngineError::NotFound);
        }

        let raw = serde_json::to_string(&entry).map_err(|e| EngineError::Storage(e.to_string()))?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let next_seq: i64 = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) + 1 as next_seq FROM job_logs WHERE job_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?
        .try_get("next_seq")
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        sqlx::query("INSERT INTO job_logs (job_id, seq, entry) VALUES (?, ?, ?)")
            .bind(id)
            .bind(next_seq)
            .bind(raw)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        sqlx::query("DELETE FROM job_logs WHERE job_id = ? AND seq <= ? - ?")
            .bind(id)
            .bind(next_seq)
            .bind(LOG_CAP as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        tx.commit().await.map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<JobError>,
    ) -> Result<(), EngineError> {
        let status_str = serde_json::to_value(status).unwrap().as_str().unwrap().to_string();
        let error_raw = error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let result = sqlx::query("UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(status_str)
            .bind(error_raw)
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn set_output_file(&self, id: &str, path: std::path::PathBuf) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE jobs SET output_file = ?, updated_at = ? WHERE id = ?")
            .bind(path.to_string_lossy().to_string())
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn get_recently_updated(&self, limit: usize) -> Result<Vec<Job>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, status, created_at, updated_at, source_ref, source_meta, config,
                    progress, paths, output_file, error
             FROM jobs ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let (job, _) = Self::row_to_job(row)?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn delete_old_terminal(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, EngineError> {
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE updated_at < ?
               AND status IN ('complete', 'failed', 'cancelled')",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
