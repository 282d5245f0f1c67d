//! Data models for batch jobs.
//!
//! Defines job and file records, status/priority enums, and stats types.

use serde::{Deserialize, Serialize};

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobStatus {
    /// Returns true if this is a terminal state (Completed, Failed or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the owner may edit job metadata in this state.
    pub fn is_editable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Paused)
    }

    /// Returns the target of a pause/resume toggle, or None if the
    /// toggle is not allowed from this state.
    pub fn toggle_target(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Running => Some(JobStatus::Paused),
            JobStatus::Paused => Some(JobStatus::Running),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// Priority of a batch job.
/// Lower values = more urgent, so `ORDER BY priority ASC` claims urgent jobs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl JobPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(JobPriority::High),
            2 => Some(JobPriority::Medium),
            3 => Some(JobPriority::Low),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Some(JobPriority::High),
            "medium" => Some(JobPriority::Medium),
            "low" => Some(JobPriority::Low),
            _ => None,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Medium
    }
}

/// Status of a single file within a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed, // terminal
    Failed,    // terminal
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

/// A batch job record.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owning user
    pub user_id: i64,
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: Option<String>,
    /// Arbitrary JSON configuration blob, validated as JSON on write
    pub config: serde_json::Value,
    pub priority: JobPriority,
    /// Output format tag (e.g. "pdf", "png", "txt")
    pub output_format: String,
    pub status: JobStatus,
    /// Number of files, fixed at creation
    pub total_files: i64,
    pub processed_files: i64,
    pub failed_files: i64,
    /// Set when the job as a whole fails (processor-fatal error, timeout)
    pub error_message: Option<String>,
    /// Unix timestamps (seconds)
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl JobRecord {
    pub fn new(
        id: String,
        user_id: i64,
        name: String,
        priority: JobPriority,
        output_format: String,
        total_files: i64,
        now: i64,
    ) -> Self {
        Self {
            id,
            user_id,
            name,
            description: None,
            config: serde_json::Value::Null,
            priority,
            output_format,
            status: JobStatus::Pending,
            total_files,
            processed_files: 0,
            failed_files: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Returns true if all files have reached a terminal status.
    pub fn all_files_terminal(&self) -> bool {
        self.processed_files + self.failed_files == self.total_files
    }

    /// The terminal status a fully processed job ends in: failed only
    /// when every single file failed.
    pub fn final_status(&self) -> JobStatus {
        if self.failed_files == self.total_files {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

/// One input file within a batch job.
#[derive(Debug, Clone, Serialize)]
pub struct JobFileRecord {
    /// Unique identifier (UUID)
    pub id: String,
    /// Parent job
    pub job_id: String,
    /// Position within the job, defines processing order
    pub file_order: i64,
    /// Original file name as uploaded
    pub file_name: String,
    /// Declared type (lowercase extension)
    pub file_type: String,
    pub size_bytes: i64,
    /// Hex sha256 of the uploaded bytes
    pub checksum_sha256: Option<String>,
    pub status: FileStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl JobFileRecord {
    pub fn new(
        id: String,
        job_id: String,
        file_order: i64,
        file_name: String,
        file_type: String,
        size_bytes: i64,
        now: i64,
    ) -> Self {
        Self {
            id,
            job_id,
            file_order,
            file_name,
            file_type,
            size_bytes,
            checksum_sha256: None,
            status: FileStatus::Pending,
            error_message: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum_sha256 = Some(checksum);
        self
    }
}

/// A job together with its files, as returned by the detail endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobWithFiles {
    #[serde(flatten)]
    pub job: JobRecord,
    pub files: Vec<JobFileRecord>,
}

/// Aggregate counts across a user's jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatsSummary {
    pub total_jobs: i64,
    pub pending: i64,
    pub running: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total_files: i64,
    pub processed_files: i64,
    pub failed_files: i64,
}
