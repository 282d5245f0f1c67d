//! Batch job subsystem: models, persistence, upload spooling, the worker
//! pool and the manager facade the route layer talks to.

pub mod engine;
pub mod job_store;
pub mod manager;
pub mod models;
pub mod processor;
pub mod query;
mod schema;
pub mod spool;

pub use engine::{ConvertServiceClient, DocumentEngine, LocalCopyEngine};
pub use job_store::{BatchJobStore, JobMetadataPatch, SqliteBatchJobStore};
pub use manager::{BatchJobError, BatchJobManager, NewJobRequest, UploadedFile};
pub use models::{FileStatus, JobPriority, JobStatus};
pub use processor::BatchProcessor;
pub use query::{JobListFilter, JobListPage, JobOrderBy, PaginationMeta};
pub use spool::UploadSpool;
