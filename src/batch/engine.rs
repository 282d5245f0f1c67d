//! Document engine abstraction.
//!
//! The per-file unit of work is opaque to the job machinery: the processor
//! hands a spooled input file to a `DocumentEngine` and records the
//! outcome. Production deployments point at an external converter service;
//! without one, a local passthrough engine keeps the pipeline functional.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// One unit of work: a single spooled file plus the job's conversion
/// parameters.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: String,
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub output_format: String,
    pub config: serde_json::Value,
}

impl EngineRequest {
    /// Destination path for the converted file: original stem with the
    /// job's output format as extension.
    pub fn output_path(&self) -> PathBuf {
        let stem = std::path::Path::new(&self.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file_id.clone());
        self.output_dir
            .join(format!("{}.{}", stem, self.output_format))
    }
}

/// Result of a successful unit of work.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub output_path: PathBuf,
    pub bytes_written: u64,
}

/// The opaque per-file processing step.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    /// Process one file. Errors are recorded on the file and never abort
    /// the batch.
    async fn process(&self, request: &EngineRequest) -> Result<EngineOutput>;

    fn name(&self) -> &'static str;
}

/// HTTP client for an external converter service.
pub struct ConvertServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl ConvertServiceClient {
    /// # Arguments
    /// * `base_url` - Base URL of the converter (e.g., "http://localhost:8090")
    /// * `timeout_sec` - Request timeout in seconds
    pub fn new(base_url: String, timeout_sec: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .expect("Failed to create HTTP client");

        let base_url = base_url.trim_end_matches('/').to_string();

        Self { client, base_url }
    }

    /// Check if the converter service is reachable.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to converter service")?;

        if response.status().is_success() {
            Ok(())
        } else {
            bail!(
                "Converter health check failed with status: {}",
                response.status()
            )
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DocumentEngine for ConvertServiceClient {
    async fn process(&self, request: &EngineRequest) -> Result<EngineOutput> {
        let url = format!("{}/v1/convert/{}", self.base_url, request.output_format);

        let input = tokio::fs::read(&request.input_path)
            .await
            .with_context(|| format!("Failed to read spooled file {:?}", request.input_path))?;

        let response = self
            .client
            .post(&url)
            .query(&[
                ("filename", request.file_name.as_str()),
                ("type", request.file_type.as_str()),
            ])
            .json(&serde_json::json!({
                "config": request.config,
            }))
            .body(input)
            .send()
            .await
            .context("Failed to reach converter service")?;

        if !response.status().is_success() {
            bail!(
                "Converter rejected {} with status {}",
                request.file_name,
                response.status()
            );
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read converter response body")?;

        let dest = request.output_path();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }

        let mut file = File::create(&dest)
            .await
            .context("Failed to create output file")?;
        file.write_all(&bytes)
            .await
            .context("Failed to write output file")?;
        file.flush().await.context("Failed to flush output file")?;

        Ok(EngineOutput {
            output_path: dest,
            bytes_written: bytes.len() as u64,
        })
    }

    fn name(&self) -> &'static str {
        "convert-service"
    }
}

/// Stand-in engine used when no converter service is configured: copies
/// the input into the output directory unchanged. Keeps the full job
/// lifecycle exercisable in development setups.
pub struct LocalCopyEngine;

#[async_trait]
impl DocumentEngine for LocalCopyEngine {
    async fn process(&self, request: &EngineRequest) -> Result<EngineOutput> {
        let dest = request.output_path();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }

        let bytes_written = tokio::fs::copy(&request.input_path, &dest)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", request.input_path, dest))?;

        Ok(EngineOutput {
            output_path: dest,
            bytes_written,
        })
    }

    fn name(&self) -> &'static str {
        "local-copy"
    }
}
