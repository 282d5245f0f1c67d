use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod batch;
mod cache;
mod config;
mod server;
mod sqlite_persistence;
mod user;

use batch::{
    BatchJobManager, BatchProcessor, ConvertServiceClient, DocumentEngine, LocalCopyEngine,
    SqliteBatchJobStore, UploadSpool,
};
use cache::CacheService;
use config::{AppConfig, CliConfig, FileConfig};
use server::{RequestsLoggingLevel, ServerConfig};
use user::{SqliteUserStore, UserManager};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the SQLite databases (batch_jobs.db, user.db).
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory uploaded files are spooled into. Defaults to <db_dir>/spool.
    #[clap(long, value_parser = parse_path)]
    pub spool_dir: Option<PathBuf>,

    /// Optional TOML config file; its values override the CLI.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Path to the frontend directory to be statically served.
    #[clap(long)]
    pub frontend_dir_path: Option<String>,

    /// URL of the converter service performing the per-file work.
    /// Without one, a local passthrough engine is used.
    #[clap(long)]
    pub converter_url: Option<String>,

    /// Timeout in seconds for converter requests.
    #[clap(long, default_value_t = 300)]
    pub converter_timeout_sec: u64,

    /// Number of days to retain unused session tokens before pruning.
    /// Set to 0 to disable pruning.
    #[clap(long, default_value_t = 30)]
    pub token_retention_days: u64,

    /// Interval in hours between pruning runs. Only used if token_retention_days > 0.
    #[clap(long, default_value_t = 24)]
    pub prune_interval_hours: u64,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            spool_dir: self.spool_dir.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            logging_level: self.logging_level.clone(),
            frontend_dir_path: self.frontend_dir_path.clone(),
            converter_url: self.converter_url.clone(),
            converter_timeout_sec: self.converter_timeout_sec,
            token_retention_days: self.token_retention_days,
            prune_interval_hours: self.prune_interval_hours,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    info!(
        "Opening SQLite batch jobs database at {:?}...",
        app_config.batch_jobs_db_path()
    );
    let job_store = Arc::new(SqliteBatchJobStore::new(app_config.batch_jobs_db_path())?);
    let user_store = Arc::new(SqliteUserStore::new(app_config.user_db_path())?);
    let user_manager = Arc::new(UserManager::new(user_store));

    let spool = Arc::new(UploadSpool::new(
        &app_config.spool_dir,
        app_config.batch.max_file_bytes,
    ));
    spool.init().await?;

    let cache = Arc::new(CacheService::new());
    let wake = Arc::new(Notify::new());

    let engine: Arc<dyn DocumentEngine> = match &app_config.batch.converter_url {
        Some(url) => {
            info!("Converter service configured at {}", url);
            let client =
                ConvertServiceClient::new(url.clone(), app_config.batch.converter_timeout_sec);
            if let Err(e) = client.health_check().await {
                error!("Converter service health check failed: {}", e);
            }
            Arc::new(client)
        }
        None => {
            info!("No converter service configured, using the local passthrough engine");
            Arc::new(LocalCopyEngine)
        }
    };

    let batch_manager = Arc::new(BatchJobManager::new(
        job_store.clone(),
        cache.clone(),
        spool.clone(),
        app_config.batch.clone(),
        wake.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Worker pool draining the job queue
    let processor = Arc::new(BatchProcessor::new(
        job_store,
        engine,
        spool,
        cache.clone(),
        app_config.batch.clone(),
        wake,
    ));
    let processor_shutdown = shutdown.clone();
    let processor_handle = tokio::spawn(async move { processor.run(processor_shutdown).await });

    // Periodic cache sweep
    let sweeper_cache = cache.clone();
    let sweeper_shutdown = shutdown.clone();
    let sweep_interval = Duration::from_secs(app_config.cache.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        sweeper_cache
            .run_sweeper(sweep_interval, sweeper_shutdown)
            .await;
    });

    // Periodic session token pruning
    if app_config.token_retention_days > 0 {
        let retention_days = app_config.token_retention_days;
        let interval_hours = app_config.prune_interval_hours;
        let pruning_user_manager = user_manager.clone();
        let pruning_shutdown = shutdown.clone();

        info!(
            "Token pruning enabled: retaining {} days, pruning every {} hours",
            retention_days, interval_hours
        );

        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_hours * 60 * 60);
            let mut ticker = tokio::time::interval(interval);

            // Skip the first immediate tick, wait for the first interval
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match pruning_user_manager.prune_unused_auth_tokens(retention_days) {
                            Ok(count) => {
                                if count > 0 {
                                    info!("Pruned {} stale session tokens", count);
                                }
                            }
                            Err(e) => error!("Failed to prune session tokens: {}", e),
                        }
                    }
                    _ = pruning_shutdown.cancelled() => break,
                }
            }
        });
    }

    // Metrics listener on its own port
    let metrics_cache = cache.clone();
    let metrics_shutdown = shutdown.clone();
    let metrics_port = app_config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) =
            server::metrics::run_metrics_server(metrics_port, metrics_cache, metrics_shutdown).await
        {
            error!("Metrics server failed: {}", e);
        }
    });

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
        frontend_dir_path: app_config.frontend_dir_path.clone(),
        login_rate_limit: true,
        upload_body_limit_bytes: (app_config.batch.max_file_bytes as usize)
            .saturating_mul(app_config.batch.max_files_per_job)
            .min(1024 * 1024 * 1024),
    };

    // Stop everything on ctrl-c
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_shutdown.cancel();
        }
    });

    let result = server::run_server(
        server_config,
        user_manager,
        batch_manager,
        cache,
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    let _ = processor_handle.await;

    result
}
