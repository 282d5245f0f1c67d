use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub spool_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,
    pub frontend_dir_path: Option<String>,
    pub converter_url: Option<String>,
    pub converter_timeout_sec: Option<u64>,
    pub token_retention_days: Option<u64>,
    pub prune_interval_hours: Option<u64>,

    // Feature configs
    pub batch: Option<BatchConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub worker_count: Option<usize>,
    pub claim_interval_secs: Option<u64>,
    pub file_timeout_secs: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub max_files_per_job: Option<usize>,
    pub max_file_bytes: Option<u64>,
    pub max_active_jobs_per_user: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub sweep_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
