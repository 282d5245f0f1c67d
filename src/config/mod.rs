mod file_config;

pub use file_config::{BatchConfig, CacheConfig, FileConfig};

use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// Mirrors the CLI arguments that a TOML config file may override.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub converter_url: Option<String>,
    pub converter_timeout_sec: u64,
    pub token_retention_days: u64,
    pub prune_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub token_retention_days: u64,
    pub prune_interval_hours: u64,

    // Feature configs (with defaults)
    pub batch: BatchSettings,
    pub cache: CacheSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let spool_dir = file
            .spool_dir
            .map(PathBuf::from)
            .or_else(|| cli.spool_dir.clone())
            .unwrap_or_else(|| db_dir.join("spool"));

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let frontend_dir_path = file
            .frontend_dir_path
            .or_else(|| cli.frontend_dir_path.clone());

        let converter_url = file
            .converter_url
            .clone()
            .or_else(|| cli.converter_url.clone());
        let converter_timeout_sec = file
            .converter_timeout_sec
            .unwrap_or(cli.converter_timeout_sec);

        let token_retention_days = file.token_retention_days.unwrap_or(cli.token_retention_days);
        let prune_interval_hours = file.prune_interval_hours.unwrap_or(cli.prune_interval_hours);

        // Batch settings - merge file config with defaults
        let batch_file = file.batch.unwrap_or_default();
        let batch = BatchSettings {
            worker_count: batch_file.worker_count.unwrap_or(2).max(1),
            claim_interval_secs: batch_file.claim_interval_secs.unwrap_or(5),
            file_timeout_secs: batch_file.file_timeout_secs.unwrap_or(300),
            job_timeout_secs: batch_file.job_timeout_secs.unwrap_or(3600),
            max_files_per_job: batch_file.max_files_per_job.unwrap_or(50),
            max_file_bytes: batch_file.max_file_bytes.unwrap_or(50 * 1024 * 1024),
            max_active_jobs_per_user: batch_file.max_active_jobs_per_user.unwrap_or(10),
            converter_url,
            converter_timeout_sec,
        };

        let cache_file = file.cache.unwrap_or_default();
        let cache = CacheSettings {
            sweep_interval_secs: cache_file.sweep_interval_secs.unwrap_or(60),
        };

        Ok(Self {
            db_dir,
            spool_dir,
            port,
            metrics_port,
            logging_level,
            frontend_dir_path,
            token_retention_days,
            prune_interval_hours,
            batch,
            cache,
        })
    }

    pub fn batch_jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("batch_jobs.db")
    }

    pub fn user_db_path(&self) -> PathBuf {
        self.db_dir.join("user.db")
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Number of concurrent job workers.
    pub worker_count: usize,
    /// Fallback poll interval for claiming work when no wake signal fires.
    pub claim_interval_secs: u64,
    /// Per-file processing timeout. 0 disables the timeout.
    pub file_timeout_secs: u64,
    /// Per-job wall-clock deadline. 0 disables the deadline.
    pub job_timeout_secs: u64,
    pub max_files_per_job: usize,
    pub max_file_bytes: u64,
    /// Admission limit on non-terminal jobs per user.
    pub max_active_jobs_per_user: usize,
    /// External converter service, None runs the local passthrough engine.
    pub converter_url: Option<String>,
    pub converter_timeout_sec: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            claim_interval_secs: 5,
            file_timeout_secs: 300,
            job_timeout_secs: 3600,
            max_files_per_job: 50,
            max_file_bytes: 50 * 1024 * 1024,
            max_active_jobs_per_user: 10,
            converter_url: None,
            converter_timeout_sec: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

/// Parses a logging level string using clap's ValueEnum trait.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("path"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(matches!(
            parse_logging_level("BODY"),
            Some(RequestsLoggingLevel::Body)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            port: 3001,
            metrics_port: 9091,
            logging_level: RequestsLoggingLevel::Headers,
            converter_url: Some("http://converter:8090".to_string()),
            converter_timeout_sec: 600,
            token_retention_days: 60,
            prune_interval_hours: 12,
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.spool_dir, temp_dir.path().join("spool"));
        assert_eq!(config.port, 3001);
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Headers);
        assert_eq!(
            config.batch.converter_url,
            Some("http://converter:8090".to_string())
        );
        assert_eq!(config.batch.converter_timeout_sec, 600);
        assert_eq!(config.token_retention_days, 60);
        assert_eq!(config.prune_interval_hours, 12);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            port: 3001,
            metrics_port: 9091,
            logging_level: RequestsLoggingLevel::Path,
            ..Default::default()
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            port: Some(4000),
            logging_level: Some("body".to_string()),
            batch: Some(BatchConfig {
                worker_count: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 4000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Body);
        assert_eq!(config.batch.worker_count, 4);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_batch_defaults() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.batch.worker_count, 2);
        assert_eq!(config.batch.max_files_per_job, 50);
        assert_eq!(config.batch.max_active_jobs_per_user, 10);
        assert!(config.batch.converter_url.is_none());
        assert_eq!(config.cache.sweep_interval_secs, 60);
    }

    #[test]
    fn test_worker_count_minimum_of_one() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file = FileConfig {
            batch: Some(BatchConfig {
                worker_count: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.batch.worker_count, 1);
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(
            config.batch_jobs_db_path(),
            temp_dir.path().join("batch_jobs.db")
        );
        assert_eq!(config.user_db_path(), temp_dir.path().join("user.db"));
    }
}
