//! Background worker pool for batch jobs.
//!
//! Workers claim runnable jobs from the store (highest priority, oldest
//! first) and walk each job's files in order. Progress counters are
//! persisted after every file, the job status is re-read before every
//! file so pause and cancel interrupt between files, and every claimed
//! job ends in a terminal status even on crash paths. A RUNNING job held
//! by no worker is claimable again, which doubles as crash recovery
//! after a restart.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheCategory, CacheService};
use crate::config::BatchSettings;
use crate::server::metrics;

use super::engine::{DocumentEngine, EngineRequest};
use super::job_store::BatchJobStore;
use super::models::{JobRecord, JobStatus};
use super::spool::UploadSpool;

pub struct BatchProcessor {
    store: Arc<dyn BatchJobStore>,
    engine: Arc<dyn DocumentEngine>,
    spool: Arc<UploadSpool>,
    cache: Arc<CacheService>,
    settings: BatchSettings,
    wake: Arc<Notify>,
    /// Jobs currently held by a worker of this process.
    active: Mutex<HashSet<String>>,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn BatchJobStore>,
        engine: Arc<dyn DocumentEngine>,
        spool: Arc<UploadSpool>,
        cache: Arc<CacheService>,
        settings: BatchSettings,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            engine,
            spool,
            cache,
            settings,
            wake,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns the worker pool and runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Batch processor starting ({} workers, engine {})",
            self.settings.worker_count,
            self.engine.name()
        );

        let mut handles = Vec::new();
        for worker_id in 0..self.settings.worker_count {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                processor.worker_loop(worker_id, shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!("Batch processor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        let claim_interval = Duration::from_secs(self.settings.claim_interval_secs.max(1));
        debug!("Worker {} started", worker_id);

        loop {
            if let Err(e) = self.process_available(&shutdown).await {
                error!("Worker {} claim loop error: {}", worker_id, e);
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(claim_interval) => {}
                _ = shutdown.cancelled() => {
                    debug!("Worker {} shutting down", worker_id);
                    break;
                }
            }
        }
    }

    /// Claims and processes jobs until no runnable job remains. Returns
    /// the number of jobs processed.
    pub async fn process_available(&self, shutdown: &CancellationToken) -> Result<usize> {
        let mut processed = 0;

        while !shutdown.is_cancelled() {
            let job = match self.claim_next()? {
                Some(job) => job,
                None => break,
            };

            self.process_job(job, shutdown).await;
            processed += 1;
        }

        Ok(processed)
    }

    /// Atomically claims the next runnable job: PENDING jobs via a CAS to
    /// RUNNING, or RUNNING jobs no worker holds (resume / recovery).
    fn claim_next(&self) -> Result<Option<JobRecord>> {
        loop {
            let held: Vec<String> = self.active.lock().unwrap().iter().cloned().collect();
            let candidate = match self.store.next_runnable(&held)? {
                Some(job) => job,
                None => return Ok(None),
            };

            match candidate.status {
                JobStatus::Pending => {
                    // Another worker may claim it first; the CAS decides
                    if !self.store.claim_for_processing(&candidate.id)? {
                        continue;
                    }
                }
                JobStatus::Running => {
                    debug!("Re-claiming running job {} (resume)", candidate.id);
                }
                _ => continue,
            }

            let inserted = self.active.lock().unwrap().insert(candidate.id.clone());
            if !inserted {
                // Raced with another worker of this process
                continue;
            }

            let job = self
                .store
                .get_job(&candidate.id)?
                .ok_or_else(|| anyhow!("Claimed job {} disappeared", candidate.id))?;
            return Ok(Some(job));
        }
    }

    async fn process_job(&self, job: JobRecord, shutdown: &CancellationToken) {
        let job_id = job.id.clone();

        let outcome = self.run_job(&job, shutdown).await;
        if let Err(e) = outcome {
            // Fatal processor error: the job must still end terminal
            error!("Job {} failed fatally: {}", job_id, e);
            match self
                .store
                .finalize_job(&job_id, JobStatus::Failed, Some(&e.to_string()))
            {
                Ok(true) => {
                    metrics::record_job_finished("failed");
                    self.invalidate_read_caches();
                }
                Ok(false) => {}
                Err(e) => error!("Failed to mark job {} as failed: {}", job_id, e),
            }
        }

        self.active.lock().unwrap().remove(&job_id);
    }

    async fn run_job(&self, job: &JobRecord, shutdown: &CancellationToken) -> Result<()> {
        info!(
            "Processing job {} ({} files, priority {:?})",
            job.id, job.total_files, job.priority
        );

        // Files interrupted mid-flight by a pause or crash go back to
        // pending before this pass
        self.store.reset_processing_files(&job.id)?;
        let files = self.store.get_files(&job.id)?;

        let deadline = match self.settings.job_timeout_secs {
            0 => None,
            secs => Some(Instant::now() + Duration::from_secs(secs)),
        };

        for file in files.iter().filter(|f| !f.status.is_terminal()) {
            if shutdown.is_cancelled() {
                // Leave the job RUNNING; the next startup re-claims it
                info!("Shutdown requested, parking job {}", job.id);
                return Ok(());
            }

            // Pause and cancel take effect between files
            let current = self
                .store
                .get_job(&job.id)?
                .ok_or_else(|| anyhow!("Job {} disappeared mid-processing", job.id))?;
            if current.status != JobStatus::Running {
                info!(
                    "Job {} is {} now, parking",
                    job.id,
                    current.status.as_db_str()
                );
                return Ok(());
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("Job {} exceeded its processing deadline", job.id);
                    if self.store.finalize_job(
                        &job.id,
                        JobStatus::Failed,
                        Some("Job processing deadline exceeded"),
                    )? {
                        metrics::record_job_finished("failed");
                        self.invalidate_read_caches();
                    }
                    return Ok(());
                }
            }

            if !self.store.mark_file_processing(&file.id, &job.id)? {
                // The job left RUNNING under us or the file is already
                // terminal; the next loop iteration re-checks
                continue;
            }

            self.process_file(&current, file).await?;
        }

        // All files terminal: failed only when every file failed
        let current = self
            .store
            .get_job(&job.id)?
            .ok_or_else(|| anyhow!("Job {} disappeared after processing", job.id))?;
        if current.status == JobStatus::Running && current.all_files_terminal() {
            let final_status = current.final_status();
            if self.store.finalize_job(&job.id, final_status, None)? {
                info!(
                    "Job {} finished as {} ({} processed, {} failed)",
                    job.id,
                    final_status.as_db_str(),
                    current.processed_files,
                    current.failed_files
                );
                metrics::record_job_finished(final_status.as_db_str());
                self.invalidate_read_caches();
            }
        }

        Ok(())
    }

    /// Runs the engine for one file and records the outcome. A failed
    /// file never aborts the batch.
    async fn process_file(
        &self,
        job: &JobRecord,
        file: &super::models::JobFileRecord,
    ) -> Result<()> {
        let input_path = match self
            .spool
            .spooled_input_path(&job.id, file.file_order, &file.file_name)
        {
            Ok(path) => path,
            Err(e) => {
                self.store
                    .mark_file_failed(&file.id, &job.id, &format!("Missing spooled input: {}", e))?;
                metrics::record_file_processed("failed");
                return Ok(());
            }
        };

        let request = EngineRequest {
            job_id: job.id.clone(),
            file_id: file.id.clone(),
            file_name: file.file_name.clone(),
            file_type: file.file_type.clone(),
            input_path,
            output_dir: self.spool.job_output_dir(&job.id),
            output_format: job.output_format.clone(),
            config: job.config.clone(),
        };

        let result = match self.settings.file_timeout_secs {
            0 => Ok(self.engine.process(&request).await),
            secs => {
                tokio::time::timeout(Duration::from_secs(secs), self.engine.process(&request)).await
            }
        };

        match result {
            Ok(Ok(output)) => {
                debug!(
                    "File {} of job {} completed ({} bytes)",
                    file.file_name, job.id, output.bytes_written
                );
                self.store.mark_file_completed(&file.id, &job.id)?;
                metrics::record_file_processed("completed");
            }
            Ok(Err(e)) => {
                warn!("File {} of job {} failed: {}", file.file_name, job.id, e);
                self.store
                    .mark_file_failed(&file.id, &job.id, &e.to_string())?;
                metrics::record_file_processed("failed");
            }
            Err(_) => {
                warn!(
                    "File {} of job {} timed out after {}s",
                    file.file_name, job.id, self.settings.file_timeout_secs
                );
                self.store
                    .mark_file_failed(&file.id, &job.id, "File processing timed out")?;
                metrics::record_file_processed("failed");
            }
        }

        Ok(())
    }

    fn invalidate_read_caches(&self) {
        self.cache.invalidate_category(CacheCategory::Jobs);
        self.cache.invalidate_category(CacheCategory::Metrics);
    }
}
