//! Upload spooling for batch job files.
//!
//! Uploaded bytes are written to a per-job directory on disk before the
//! create request returns; the processor later feeds the spooled files to
//! the document engine. Filenames are sanitized and every file is
//! checksummed on the way in.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Errors that can occur while spooling uploads.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("File too large: {0} bytes (max: {1})")]
    FileTooLarge(u64, u64),
}

/// A spooled upload.
#[derive(Debug, Clone)]
pub struct SpooledFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex sha256 of the uploaded bytes
    pub checksum_sha256: String,
    /// Lowercase extension, falling back to content sniffing for
    /// extension-less uploads
    pub file_type: String,
}

/// Writes uploaded files into a per-job spool directory.
pub struct UploadSpool {
    base_dir: PathBuf,
    max_file_bytes: u64,
}

impl UploadSpool {
    pub fn new(base_dir: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_file_bytes,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates the spool base directory.
    pub async fn init(&self) -> Result<(), SpoolError> {
        fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    /// Directory holding a job's input files.
    pub fn job_input_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(job_id).join("in")
    }

    /// Directory the engine writes a job's outputs into.
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join(job_id).join("out")
    }

    /// Save uploaded bytes under the job's input directory.
    ///
    /// The stored name is prefixed with the file order so duplicate
    /// upload names within one job cannot collide.
    pub async fn save_upload(
        &self,
        job_id: &str,
        file_order: i64,
        filename: &str,
        data: &[u8],
    ) -> Result<SpooledFile, SpoolError> {
        let size = data.len() as u64;
        if size > self.max_file_bytes {
            return Err(SpoolError::FileTooLarge(size, self.max_file_bytes));
        }

        let safe_filename = sanitize_filename(filename)?;

        let job_dir = self.job_input_dir(job_id);
        fs::create_dir_all(&job_dir).await?;

        let path = job_dir.join(format!("{:04}-{}", file_order, safe_filename));
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(SpooledFile {
            path,
            size_bytes: size,
            checksum_sha256: sha256_hex(data),
            file_type: detect_file_type(filename, data),
        })
    }

    /// Path a previously spooled upload was written to. Fails on names
    /// that could not have been spooled in the first place.
    pub fn spooled_input_path(
        &self,
        job_id: &str,
        file_order: i64,
        filename: &str,
    ) -> Result<PathBuf, SpoolError> {
        let safe_filename = sanitize_filename(filename)?;
        Ok(self
            .job_input_dir(job_id)
            .join(format!("{:04}-{}", file_order, safe_filename)))
    }

    /// Remove a job's entire spool directory (inputs and outputs).
    pub async fn remove_job_dir(&self, job_id: &str) -> Result<(), SpoolError> {
        let dir = self.base_dir.join(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Hex-encoded sha256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Declared type of an upload: the lowercase extension, or a sniffed type
/// when the name has no usable extension.
pub fn detect_file_type(filename: &str, data: &[u8]) -> String {
    if let Some(ext) = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
    {
        if !ext.is_empty() {
            return ext;
        }
    }

    infer::get(data)
        .map(|kind| kind.extension().to_string())
        .unwrap_or_else(|| "bin".to_string())
}

/// Strips path components and rejects names that would escape the spool
/// directory.
fn sanitize_filename(filename: &str) -> Result<String, SpoolError> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SpoolError::InvalidFilename(filename.to_string()))?;

    if name.is_empty() || name == "." || name == ".." {
        return Err(SpoolError::InvalidFilename(filename.to_string()));
    }

    Ok(name.to_string())
}
