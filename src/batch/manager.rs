//! Batch job orchestration.
//!
//! The manager is the single entry point the route layer talks to:
//! validation, creation (spool + atomic insert), guarded lifecycle
//! transitions, cached reads, and cache invalidation on every mutation.
//! Processing itself happens in the worker pool, which the manager wakes
//! through a shared `Notify`.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cache::{CacheCategory, CacheService};
use crate::config::BatchSettings;

use super::job_store::{BatchJobStore, JobMetadataPatch};
use super::models::*;
use super::query::{list_cache_key, JobListFilter, JobListPage, PaginationMeta};
use super::spool::{SpoolError, UploadSpool};

/// Errors surfaced to the route layer. Validation and state conflicts map
/// to 400, missing/foreign jobs to 404, everything else to 500.
#[derive(Debug, Error)]
pub enum BatchJobError {
    #[error("{0}")]
    Validation(String),

    #[error("Job not found")]
    NotFound,

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One uploaded file, already decoded from the multipart request.
pub struct UploadedFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Parameters for creating a job.
pub struct NewJobRequest {
    pub name: String,
    pub description: Option<String>,
    /// Raw JSON string from the form field; validated here
    pub config: Option<String>,
    pub priority: JobPriority,
    pub output_format: Option<String>,
    pub files: Vec<UploadedFile>,
}

/// Result of a cached list query.
pub struct JobListResult {
    pub jobs: serde_json::Value,
    pub pagination: PaginationMeta,
}

pub struct BatchJobManager {
    store: Arc<dyn BatchJobStore>,
    cache: Arc<CacheService>,
    spool: Arc<UploadSpool>,
    settings: BatchSettings,
    wake: Arc<Notify>,
}

impl BatchJobManager {
    pub fn new(
        store: Arc<dyn BatchJobStore>,
        cache: Arc<CacheService>,
        spool: Arc<UploadSpool>,
        settings: BatchSettings,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            cache,
            spool,
            settings,
            wake,
        }
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Validate and persist a new job with its files, spooling the
    /// uploaded bytes. The job starts PENDING; a worker is woken to pick
    /// it up.
    pub async fn create_job(
        &self,
        user_id: i64,
        request: NewJobRequest,
    ) -> Result<JobRecord, BatchJobError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(BatchJobError::Validation("Job name is required".into()));
        }
        if request.files.is_empty() {
            return Err(BatchJobError::Validation(
                "At least one file is required".into(),
            ));
        }
        if request.files.len() > self.settings.max_files_per_job {
            return Err(BatchJobError::Validation(format!(
                "Too many files: {} (max {})",
                request.files.len(),
                self.settings.max_files_per_job
            )));
        }

        let config = match request.config.as_deref().map(str::trim) {
            None | Some("") => serde_json::Value::Null,
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BatchJobError::Validation(format!("Invalid config JSON: {}", e)))?,
        };

        let output_format = match request.output_format.as_deref().map(str::trim) {
            None | Some("") => "pdf".to_string(),
            Some(format) => format.to_lowercase(),
        };

        let active = self
            .store
            .count_active_jobs(user_id)
            .map_err(BatchJobError::Internal)?;
        if active >= self.settings.max_active_jobs_per_user {
            return Err(BatchJobError::Validation(format!(
                "Too many active jobs: {} (max {})",
                active, self.settings.max_active_jobs_per_user
            )));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let now = unix_now();

        let mut job = JobRecord::new(
            job_id.clone(),
            user_id,
            name,
            request.priority,
            output_format,
            request.files.len() as i64,
            now,
        )
        .with_description(request.description.filter(|d| !d.trim().is_empty()))
        .with_config(config);
        job.updated_at = now;

        let mut file_records = Vec::with_capacity(request.files.len());
        for (order, upload) in request.files.iter().enumerate() {
            if upload.data.is_empty() {
                self.cleanup_spool(&job_id).await;
                return Err(BatchJobError::Validation(format!(
                    "File '{}' is empty",
                    upload.name
                )));
            }

            let spooled = match self
                .spool
                .save_upload(&job_id, order as i64, &upload.name, &upload.data)
                .await
            {
                Ok(s) => s,
                Err(e @ (SpoolError::FileTooLarge(..) | SpoolError::InvalidFilename(_))) => {
                    self.cleanup_spool(&job_id).await;
                    return Err(BatchJobError::Validation(e.to_string()));
                }
                Err(e) => {
                    self.cleanup_spool(&job_id).await;
                    return Err(BatchJobError::Internal(e.into()));
                }
            };

            file_records.push(
                JobFileRecord::new(
                    uuid::Uuid::new_v4().to_string(),
                    job_id.clone(),
                    order as i64,
                    upload.name.clone(),
                    spooled.file_type,
                    spooled.size_bytes as i64,
                    now,
                )
                .with_checksum(spooled.checksum_sha256),
            );
        }

        if let Err(e) = self.store.create_job_with_files(&job, &file_records) {
            self.cleanup_spool(&job_id).await;
            return Err(BatchJobError::Internal(e));
        }

        info!(
            "Created job {} for user {} ({} files, priority {:?})",
            job.id,
            user_id,
            file_records.len(),
            job.priority
        );

        self.invalidate_job_caches();
        self.wake.notify_one();

        Ok(job)
    }

    async fn cleanup_spool(&self, job_id: &str) {
        if let Err(e) = self.spool.remove_job_dir(job_id).await {
            warn!("Failed to clean up spool for job {}: {}", job_id, e);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// One job with its files. Always reads the store directly so
    /// progress polling is never stale.
    pub fn get_job(&self, user_id: i64, job_id: &str) -> Result<JobWithFiles, BatchJobError> {
        let job = self
            .store
            .get_job_for_user(job_id, user_id)
            .map_err(BatchJobError::Internal)?
            .ok_or(BatchJobError::NotFound)?;

        let files = self
            .store
            .get_files(job_id)
            .map_err(BatchJobError::Internal)?;

        Ok(JobWithFiles { job, files })
    }

    /// Filtered, paginated listing, read through the jobs cache.
    pub async fn list_jobs(
        &self,
        user_id: i64,
        filter: &JobListFilter,
        page: &JobListPage,
    ) -> Result<JobListResult, BatchJobError> {
        let key = list_cache_key(user_id, filter, page);

        let value = self
            .cache
            .get_or_fetch(CacheCategory::Jobs, &key, None, || async {
                let jobs = self.store.list_jobs(user_id, filter, page)?;
                let total = self.store.count_jobs(user_id, filter)?;
                Ok(json!({
                    "jobs": jobs,
                    "pagination": PaginationMeta::new(page, total),
                }))
            })
            .await
            .map_err(BatchJobError::Internal)?;

        let pagination = serde_json::from_value(value["pagination"].clone())
            .map_err(|e| BatchJobError::Internal(e.into()))?;

        Ok(JobListResult {
            jobs: value["jobs"].clone(),
            pagination,
        })
    }

    /// Aggregate counts across the user's jobs, read through the metrics
    /// cache.
    pub async fn stats_summary(&self, user_id: i64) -> Result<serde_json::Value, BatchJobError> {
        let key = format!("stats:{}", user_id);

        self.cache
            .get_or_fetch(CacheCategory::Metrics, &key, None, || async {
                let stats = self.store.stats_for_user(user_id)?;
                Ok(serde_json::to_value(stats)?)
            })
            .await
            .map_err(BatchJobError::Internal)
    }

    // =========================================================================
    // Lifecycle transitions
    // =========================================================================

    /// Edit job metadata, allowed only while PENDING or PAUSED.
    pub fn update_job(
        &self,
        user_id: i64,
        job_id: &str,
        patch: JobMetadataPatch,
    ) -> Result<JobRecord, BatchJobError> {
        let job = self.owned_job(user_id, job_id)?;

        if patch.is_empty() {
            return Err(BatchJobError::Validation("Nothing to update".into()));
        }
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(BatchJobError::Validation("Job name cannot be empty".into()));
            }
        }

        let updated = self
            .store
            .update_job_metadata(job_id, &patch)
            .map_err(BatchJobError::Internal)?;
        if !updated {
            return Err(BatchJobError::InvalidState(format!(
                "Job cannot be edited while {}",
                job.status.as_db_str()
            )));
        }

        self.invalidate_job_caches();
        self.owned_job(user_id, job_id)
    }

    /// Flip RUNNING ⇄ PAUSED. Any other source state is rejected.
    pub fn toggle_job(&self, user_id: i64, job_id: &str) -> Result<JobRecord, BatchJobError> {
        let job = self.owned_job(user_id, job_id)?;

        let flipped = match job.status {
            JobStatus::Running => self
                .store
                .pause_job(job_id)
                .map_err(BatchJobError::Internal)?,
            JobStatus::Paused => {
                let resumed = self
                    .store
                    .resume_job(job_id)
                    .map_err(BatchJobError::Internal)?;
                if resumed {
                    // Make the job claimable again right away
                    self.wake.notify_one();
                }
                resumed
            }
            other => {
                return Err(BatchJobError::InvalidState(format!(
                    "Only running or paused jobs can be toggled, job is {}",
                    other.as_db_str()
                )))
            }
        };

        if !flipped {
            // The status changed between the read and the guarded update
            return Err(BatchJobError::InvalidState(
                "Job state changed concurrently, try again".into(),
            ));
        }

        info!("Toggled job {} from {}", job_id, job.status.as_db_str());
        self.invalidate_job_caches();
        self.owned_job(user_id, job_id)
    }

    /// Soft-cancel. Rejected for COMPLETED jobs; already-terminated jobs
    /// (failed/cancelled) are left untouched.
    pub fn cancel_job(&self, user_id: i64, job_id: &str) -> Result<JobRecord, BatchJobError> {
        let job = self.owned_job(user_id, job_id)?;

        match job.status {
            JobStatus::Completed => {
                return Err(BatchJobError::InvalidState(
                    "Completed jobs cannot be cancelled".into(),
                ))
            }
            // Terminal already; cancellation is a no-op rather than a
            // status rewrite
            JobStatus::Failed | JobStatus::Cancelled => return Ok(job),
            _ => {}
        }

        let cancelled = self
            .store
            .cancel_job(job_id)
            .map_err(BatchJobError::Internal)?;
        if !cancelled {
            // Raced with the processor finalizing or another cancel
            let current = self.owned_job(user_id, job_id)?;
            if current.status == JobStatus::Completed {
                return Err(BatchJobError::InvalidState(
                    "Completed jobs cannot be cancelled".into(),
                ));
            }
            return Ok(current);
        }

        info!("Cancelled job {} for user {}", job_id, user_id);
        self.invalidate_job_caches();
        self.owned_job(user_id, job_id)
    }

    fn owned_job(&self, user_id: i64, job_id: &str) -> Result<JobRecord, BatchJobError> {
        self.store
            .get_job_for_user(job_id, user_id)
            .map_err(BatchJobError::Internal)?
            .ok_or(BatchJobError::NotFound)
    }

    /// Mutations invalidate the whole jobs and metrics categories so no
    /// stale list or stat read survives a write.
    pub fn invalidate_job_caches(&self) {
        self.cache.invalidate_category(CacheCategory::Jobs);
        self.cache.invalidate_category(CacheCategory::Metrics);
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::job_store::SqliteBatchJobStore;
    use tempfile::tempdir;

    fn make_manager(settings: BatchSettings) -> (BatchJobManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteBatchJobStore::in_memory().unwrap());
        let cache = Arc::new(CacheService::new());
        let spool = Arc::new(UploadSpool::new(dir.path(), settings.max_file_bytes));
        let manager = BatchJobManager::new(store, cache, spool, settings, Arc::new(Notify::new()));
        (manager, dir)
    }

    fn upload(name: &str) -> UploadedFile {
        UploadedFile {
            name: name.to_string(),
            data: b"%PDF-1.7 test".to_vec(),
        }
    }

    fn new_request(name: &str, files: Vec<UploadedFile>) -> NewJobRequest {
        NewJobRequest {
            name: name.to_string(),
            description: None,
            config: None,
            priority: JobPriority::Medium,
            output_format: None,
            files,
        }
    }

    #[tokio::test]
    async fn test_create_job_happy_path() {
        let (manager, _dir) = make_manager(BatchSettings::default());

        let job = manager
            .create_job(1, new_request("Merge", vec![upload("a.pdf"), upload("b.pdf")]))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_files, 2);
        assert_eq!(job.output_format, "pdf");

        let detail = manager.get_job(1, &job.id).unwrap();
        assert_eq!(detail.files.len(), 2);
        assert!(detail.files[0].checksum_sha256.is_some());
        assert_eq!(detail.files[0].file_type, "pdf");
    }

    #[tokio::test]
    async fn test_create_job_requires_name() {
        let (manager, _dir) = make_manager(BatchSettings::default());

        let err = manager
            .create_job(1, new_request("   ", vec![upload("a.pdf")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchJobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_job_rejects_zero_files() {
        let (manager, _dir) = make_manager(BatchSettings::default());

        let err = manager
            .create_job(1, new_request("Empty", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchJobError::Validation(_)));
        assert!(err.to_string().contains("At least one file"));
    }

    #[tokio::test]
    async fn test_create_job_rejects_invalid_config_json() {
        let (manager, _dir) = make_manager(BatchSettings::default());

        let mut request = new_request("Bad config", vec![upload("a.pdf")]);
        request.config = Some("{not json".to_string());

        let err = manager.create_job(1, request).await.unwrap_err();
        assert!(err.to_string().contains("Invalid config JSON"));
    }

    #[tokio::test]
    async fn test_create_job_parses_config() {
        let (manager, _dir) = make_manager(BatchSettings::default());

        let mut request = new_request("With config", vec![upload("a.pdf")]);
        request.config = Some(r#"{"dpi": 150}"#.to_string());

        let job = manager.create_job(1, request).await.unwrap();
        assert_eq!(job.config["dpi"], 150);
    }

    #[tokio::test]
    async fn test_create_job_admission_limit() {
        let settings = BatchSettings {
            max_active_jobs_per_user: 2,
            ..Default::default()
        };
        let (manager, _dir) = make_manager(settings);

        for i in 0..2 {
            manager
                .create_job(1, new_request(&format!("job-{}", i), vec![upload("a.pdf")]))
                .await
                .unwrap();
        }

        let err = manager
            .create_job(1, new_request("one too many", vec![upload("a.pdf")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many active jobs"));

        // Other users are unaffected
        manager
            .create_job(2, new_request("other user", vec![upload("a.pdf")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_job_scoped_to_owner() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Mine", vec![upload("a.pdf")]))
            .await
            .unwrap();

        assert!(manager.get_job(1, &job.id).is_ok());
        assert!(matches!(
            manager.get_job(2, &job.id).unwrap_err(),
            BatchJobError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_toggle_rejected_from_pending() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Pending", vec![upload("a.pdf")]))
            .await
            .unwrap();

        let err = manager.toggle_job(1, &job.id).unwrap_err();
        assert!(matches!(err, BatchJobError::InvalidState(_)));
        assert!(err.to_string().contains("pending"));
    }

    #[tokio::test]
    async fn test_toggle_running_and_paused() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Toggle", vec![upload("a.pdf")]))
            .await
            .unwrap();

        // Simulate the processor claiming the job
        manager.store.claim_for_processing(&job.id).unwrap();

        let paused = manager.toggle_job(1, &job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        let resumed = manager.toggle_job(1, &job.id).unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Cancel me", vec![upload("a.pdf")]))
            .await
            .unwrap();

        let cancelled = manager.cancel_job(1, &job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Cancelling again is a no-op
        let again = manager.cancel_job(1, &job.id).unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_completed_rejected() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Done", vec![upload("a.pdf")]))
            .await
            .unwrap();
        manager.store.claim_for_processing(&job.id).unwrap();
        manager
            .store
            .finalize_job(&job.id, JobStatus::Completed, None)
            .unwrap();

        let err = manager.cancel_job(1, &job.id).unwrap_err();
        assert!(matches!(err, BatchJobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_update_job_metadata_guards() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Edit me", vec![upload("a.pdf")]))
            .await
            .unwrap();

        let patch = JobMetadataPatch {
            name: Some("Renamed".to_string()),
            ..Default::default()
        };
        let updated = manager.update_job(1, &job.id, patch.clone()).unwrap();
        assert_eq!(updated.name, "Renamed");

        // Not editable while running
        manager.store.claim_for_processing(&job.id).unwrap();
        let err = manager.update_job(1, &job.id, patch).unwrap_err();
        assert!(matches!(err, BatchJobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_update_job_empty_patch_rejected() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        let job = manager
            .create_job(1, new_request("Edit me", vec![upload("a.pdf")]))
            .await
            .unwrap();

        let err = manager
            .update_job(1, &job.id, JobMetadataPatch::default())
            .unwrap_err();
        assert!(matches!(err, BatchJobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_jobs_cache_invalidated_on_create() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        manager
            .create_job(1, new_request("first", vec![upload("a.pdf")]))
            .await
            .unwrap();

        let filter = JobListFilter::default();
        let page = JobListPage::default();

        let result = manager.list_jobs(1, &filter, &page).await.unwrap();
        assert_eq!(result.pagination.total, 1);

        // A second create must not serve the stale cached listing
        manager
            .create_job(1, new_request("second", vec![upload("b.pdf")]))
            .await
            .unwrap();
        let result = manager.list_jobs(1, &filter, &page).await.unwrap();
        assert_eq!(result.pagination.total, 2);
    }

    #[tokio::test]
    async fn test_stats_summary() {
        let (manager, _dir) = make_manager(BatchSettings::default());
        manager
            .create_job(1, new_request("a", vec![upload("a.pdf"), upload("b.pdf")]))
            .await
            .unwrap();
        let job = manager
            .create_job(1, new_request("b", vec![upload("c.pdf")]))
            .await
            .unwrap();
        manager.cancel_job(1, &job.id).unwrap();

        let stats = manager.stats_summary(1).await.unwrap();
        assert_eq!(stats["total_jobs"], 2);
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["cancelled"], 1);
        assert_eq!(stats["total_files"], 3);
    }
}
