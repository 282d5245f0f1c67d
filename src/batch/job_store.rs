//! Batch job storage and persistence.
//!
//! Provides SQLite-backed storage for jobs and their files. All state
//! transitions are conditional UPDATEs keyed on the expected status, so a
//! racing writer (user toggle vs. processor) can never clobber a
//! transition it did not observe: callers get `false` back when the row
//! was not in the expected state.

use super::models::*;
use super::query::{JobListFilter, JobListPage};
use super::schema::BATCH_JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Fields of a job the owner may edit while the job is PENDING or PAUSED.
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct JobMetadataPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub priority: Option<JobPriority>,
    pub output_format: Option<String>,
}

impl JobMetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.config.is_none()
            && self.priority.is_none()
            && self.output_format.is_none()
    }
}

/// Trait for batch job storage operations.
pub trait BatchJobStore: Send + Sync {
    // === Creation ===

    /// Insert a job and all its files in one transaction.
    fn create_job_with_files(&self, job: &JobRecord, files: &[JobFileRecord]) -> Result<()>;

    // === Reads ===

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Get a job only if it belongs to the given user.
    fn get_job_for_user(&self, id: &str, user_id: i64) -> Result<Option<JobRecord>>;

    /// All files of a job, ordered by file_order.
    fn get_files(&self, job_id: &str) -> Result<Vec<JobFileRecord>>;

    fn list_jobs(
        &self,
        user_id: i64,
        filter: &JobListFilter,
        page: &JobListPage,
    ) -> Result<Vec<JobRecord>>;

    /// Count matching the same filter as `list_jobs`, for pagination metadata.
    fn count_jobs(&self, user_id: i64, filter: &JobListFilter) -> Result<usize>;

    /// Number of jobs in a non-terminal status for a user (admission control).
    fn count_active_jobs(&self, user_id: i64) -> Result<usize>;

    fn stats_for_user(&self, user_id: i64) -> Result<JobStatsSummary>;

    // === Guarded job transitions (return false when the row was not in the expected state) ===

    /// Edit metadata, allowed only while PENDING or PAUSED.
    fn update_job_metadata(&self, id: &str, patch: &JobMetadataPatch) -> Result<bool>;

    /// PENDING → RUNNING; stamps started_at on first claim.
    fn claim_for_processing(&self, id: &str) -> Result<bool>;

    /// RUNNING → PAUSED.
    fn pause_job(&self, id: &str) -> Result<bool>;

    /// PAUSED → RUNNING.
    fn resume_job(&self, id: &str) -> Result<bool>;

    /// PENDING/RUNNING/PAUSED → CANCELLED; stamps completed_at.
    fn cancel_job(&self, id: &str) -> Result<bool>;

    /// RUNNING → COMPLETED or FAILED; stamps completed_at. Re-finalizing a
    /// terminal job is a no-op returning false.
    fn finalize_job(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool>;

    // === Processor queue ===

    /// Next claimable job by priority then age: PENDING, or RUNNING but not
    /// held by any live worker (resume after pause, crash recovery).
    fn next_runnable(&self, exclude_ids: &[String]) -> Result<Option<JobRecord>>;

    /// Put files stuck in PROCESSING back to PENDING (called on claim, so
    /// a file interrupted by a crash or pause is picked up again).
    fn reset_processing_files(&self, job_id: &str) -> Result<usize>;

    // === File transitions (processor only) ===

    /// PENDING → PROCESSING, only while the job is RUNNING.
    fn mark_file_processing(&self, file_id: &str, job_id: &str) -> Result<bool>;

    /// PROCESSING → COMPLETED and `processed_files += 1` in one
    /// transaction, only while the job is RUNNING.
    fn mark_file_completed(&self, file_id: &str, job_id: &str) -> Result<bool>;

    /// PROCESSING → FAILED with an error message and `failed_files += 1`
    /// in one transaction, only while the job is RUNNING.
    fn mark_file_failed(&self, file_id: &str, job_id: &str, error: &str) -> Result<bool>;
}

/// SQLite-backed batch job store.
pub struct SqliteBatchJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBatchJobStore {
    /// Opens an existing database or creates a new one with the current
    /// schema, then validates and migrates as needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            BATCH_JOBS_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new batch jobs database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Batch jobs database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = BATCH_JOBS_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Batch jobs database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        BATCH_JOBS_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteBatchJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        BATCH_JOBS_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteBatchJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = BATCH_JOBS_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating batch jobs database from version {} to {}",
            current_version, target_version
        );

        for schema in BATCH_JOBS_VERSIONED_SCHEMAS
            .iter()
            .skip(current_version + 1)
        {
            if let Some(migration_fn) = schema.migration {
                info!("Running batch jobs migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;

        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let config: Option<String> = row.get("config")?;
        Ok(JobRecord {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            config: config
                .and_then(|c| serde_json::from_str(&c).ok())
                .unwrap_or(serde_json::Value::Null),
            priority: JobPriority::from_i32(row.get("priority")?).unwrap_or_default(),
            output_format: row.get("output_format")?,
            status: JobStatus::from_db_str(&row.get::<_, String>("status")?)
                .unwrap_or(JobStatus::Pending),
            total_files: row.get("total_files")?,
            processed_files: row.get("processed_files")?,
            failed_files: row.get("failed_files")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<JobFileRecord> {
        Ok(JobFileRecord {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            file_order: row.get("file_order")?,
            file_name: row.get("file_name")?,
            file_type: row.get("file_type")?,
            size_bytes: row.get("size_bytes")?,
            checksum_sha256: row.get("checksum_sha256")?,
            status: FileStatus::from_db_str(&row.get::<_, String>("status")?)
                .unwrap_or(FileStatus::Pending),
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}

impl BatchJobStore for SqliteBatchJobStore {
    fn create_job_with_files(&self, job: &JobRecord, files: &[JobFileRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"INSERT INTO batch_jobs (
                id, user_id, name, description, config, priority, output_format,
                status, total_files, processed_files, failed_files, error_message,
                created_at, started_at, completed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
            rusqlite::params![
                job.id,
                job.user_id,
                job.name,
                job.description,
                serde_json::to_string(&job.config)?,
                job.priority.as_i32(),
                job.output_format,
                job.status.as_db_str(),
                job.total_files,
                job.processed_files,
                job.failed_files,
                job.error_message,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;

        for file in files {
            tx.execute(
                r#"INSERT INTO batch_job_files (
                    id, job_id, file_order, file_name, file_type, size_bytes,
                    checksum_sha256, status, error_message, created_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                rusqlite::params![
                    file.id,
                    file.job_id,
                    file.file_order,
                    file.file_name,
                    file.file_type,
                    file.size_bytes,
                    file.checksum_sha256,
                    file.status.as_db_str(),
                    file.error_message,
                    file.created_at,
                    file.completed_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM batch_jobs WHERE id = ?1")?;
        let job = stmt.query_row([id], Self::row_to_job).optional()?;
        Ok(job)
    }

    fn get_job_for_user(&self, id: &str, user_id: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM batch_jobs WHERE id = ?1 AND user_id = ?2")?;
        let job = stmt
            .query_row(rusqlite::params![id, user_id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn get_files(&self, job_id: &str) -> Result<Vec<JobFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM batch_job_files WHERE job_id = ?1 ORDER BY file_order ASC")?;
        let files = stmt
            .query_map([job_id], Self::row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn list_jobs(
        &self,
        user_id: i64,
        filter: &JobListFilter,
        page: &JobListPage,
    ) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut params) = filter.where_clause(user_id);
        let sql = format!(
            "SELECT * FROM batch_jobs WHERE {} {} LIMIT ? OFFSET ?",
            where_clause,
            page.order_clause(),
        );
        params.push(Box::new(page.limit as i64));
        params.push(Box::new(page.resolved_offset() as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    fn count_jobs(&self, user_id: i64, filter: &JobListFilter) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = filter.where_clause(user_id);
        let sql = format!("SELECT COUNT(*) FROM batch_jobs WHERE {}", where_clause);

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, params_refs.as_slice(), |row| row.get(0))?;

        Ok(count as usize)
    }

    fn count_active_jobs(&self, user_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM batch_jobs
               WHERE user_id = ?1 AND status IN ('pending', 'running', 'paused')"#,
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn stats_for_user(&self, user_id: i64) -> Result<JobStatsSummary> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT status, COUNT(*), SUM(total_files), SUM(processed_files), SUM(failed_files)
               FROM batch_jobs WHERE user_id = ?1 GROUP BY status"#,
        )?;

        let mut summary = JobStatsSummary::default();
        let rows = stmt.query_map([user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        for row in rows {
            let (status, count, total_files, processed_files, failed_files) = row?;
            summary.total_jobs += count;
            summary.total_files += total_files;
            summary.processed_files += processed_files;
            summary.failed_files += failed_files;
            match JobStatus::from_db_str(&status) {
                Some(JobStatus::Pending) => summary.pending += count,
                Some(JobStatus::Running) => summary.running += count,
                Some(JobStatus::Paused) => summary.paused += count,
                Some(JobStatus::Completed) => summary.completed += count,
                Some(JobStatus::Failed) => summary.failed += count,
                Some(JobStatus::Cancelled) => summary.cancelled += count,
                None => {}
            }
        }

        Ok(summary)
    }

    fn update_job_metadata(&self, id: &str, patch: &JobMetadataPatch) -> Result<bool> {
        let conn = self.conn.lock().unwrap();

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name = ?".to_string());
            params.push(Box::new(name.clone()));
        }
        if let Some(description) = &patch.description {
            sets.push("description = ?".to_string());
            params.push(Box::new(description.clone()));
        }
        if let Some(config) = &patch.config {
            sets.push("config = ?".to_string());
            params.push(Box::new(serde_json::to_string(config)?));
        }
        if let Some(priority) = patch.priority {
            sets.push("priority = ?".to_string());
            params.push(Box::new(priority.as_i32()));
        }
        if let Some(format) = &patch.output_format {
            sets.push("output_format = ?".to_string());
            params.push(Box::new(format.clone()));
        }

        if sets.is_empty() {
            return Ok(false);
        }

        sets.push("updated_at = ?".to_string());
        params.push(Box::new(Self::now()));
        params.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE batch_jobs SET {} WHERE id = ? AND status IN ('pending', 'paused')",
            sets.join(", ")
        );
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let updated = conn.execute(&sql, params_refs.as_slice())?;

        Ok(updated == 1)
    }

    fn claim_for_processing(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let updated = conn.execute(
            r#"UPDATE batch_jobs
               SET status = 'running',
                   started_at = COALESCE(started_at, ?1),
                   updated_at = ?1
               WHERE id = ?2 AND status = 'pending'"#,
            rusqlite::params![now, id],
        )?;
        Ok(updated == 1)
    }

    fn pause_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE batch_jobs SET status = 'paused', updated_at = ?1 WHERE id = ?2 AND status = 'running'",
            rusqlite::params![Self::now(), id],
        )?;
        Ok(updated == 1)
    }

    fn resume_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE batch_jobs SET status = 'running', updated_at = ?1 WHERE id = ?2 AND status = 'paused'",
            rusqlite::params![Self::now(), id],
        )?;
        Ok(updated == 1)
    }

    fn cancel_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let updated = conn.execute(
            r#"UPDATE batch_jobs
               SET status = 'cancelled', completed_at = ?1, updated_at = ?1
               WHERE id = ?2 AND status IN ('pending', 'running', 'paused')"#,
            rusqlite::params![now, id],
        )?;
        Ok(updated == 1)
    }

    fn finalize_job(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            bail!("finalize_job called with non-terminal status {:?}", status);
        }
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let updated = conn.execute(
            r#"UPDATE batch_jobs
               SET status = ?1,
                   error_message = COALESCE(?2, error_message),
                   completed_at = ?3,
                   updated_at = ?3
               WHERE id = ?4 AND status = 'running'"#,
            rusqlite::params![status.as_db_str(), error, now, id],
        )?;
        Ok(updated == 1)
    }

    fn next_runnable(&self, exclude_ids: &[String]) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        let placeholders = exclude_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if exclude_ids.is_empty() {
            r#"SELECT * FROM batch_jobs
               WHERE status IN ('pending', 'running')
               ORDER BY priority ASC, created_at ASC
               LIMIT 1"#
                .to_string()
        } else {
            format!(
                r#"SELECT * FROM batch_jobs
                   WHERE status IN ('pending', 'running') AND id NOT IN ({})
                   ORDER BY priority ASC, created_at ASC
                   LIMIT 1"#,
                placeholders
            )
        };

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            exclude_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let job = stmt
            .query_row(params_refs.as_slice(), Self::row_to_job)
            .optional()?;

        Ok(job)
    }

    fn reset_processing_files(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let reset = conn.execute(
            "UPDATE batch_job_files SET status = 'pending' WHERE job_id = ?1 AND status = 'processing'",
            [job_id],
        )?;
        Ok(reset)
    }

    fn mark_file_processing(&self, file_id: &str, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE batch_job_files SET status = 'processing'
               WHERE id = ?1 AND status = 'pending'
               AND (SELECT status FROM batch_jobs WHERE id = ?2) = 'running'"#,
            rusqlite::params![file_id, job_id],
        )?;
        Ok(updated == 1)
    }

    fn mark_file_completed(&self, file_id: &str, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Self::now();

        let file_updated = tx.execute(
            r#"UPDATE batch_job_files SET status = 'completed', completed_at = ?1
               WHERE id = ?2 AND status = 'processing'"#,
            rusqlite::params![now, file_id],
        )?;
        if file_updated != 1 {
            return Ok(false);
        }

        // Counter bump is guarded on the job still being RUNNING, so a
        // pause/cancel that raced the in-flight file wins and the whole
        // transaction rolls back.
        let job_updated = tx.execute(
            r#"UPDATE batch_jobs
               SET processed_files = processed_files + 1, updated_at = ?1
               WHERE id = ?2 AND status = 'running'"#,
            rusqlite::params![now, job_id],
        )?;
        if job_updated != 1 {
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    fn mark_file_failed(&self, file_id: &str, job_id: &str, error: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Self::now();

        let file_updated = tx.execute(
            r#"UPDATE batch_job_files
               SET status = 'failed', error_message = ?1, completed_at = ?2
               WHERE id = ?3 AND status = 'processing'"#,
            rusqlite::params![error, now, file_id],
        )?;
        if file_updated != 1 {
            return Ok(false);
        }

        let job_updated = tx.execute(
            r#"UPDATE batch_jobs
               SET failed_files = failed_files + 1, updated_at = ?1
               WHERE id = ?2 AND status = 'running'"#,
            rusqlite::params![now, job_id],
        )?;
        if job_updated != 1 {
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }
}
