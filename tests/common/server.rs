//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own databases, spool
//! directory and worker pool.

use super::constants::*;
use super::fixtures::create_test_db_with_users;
use docsmith_server::batch::{
    BatchJobManager, BatchJobStore, BatchProcessor, DocumentEngine, LocalCopyEngine,
    SqliteBatchJobStore, UploadSpool,
};
use docsmith_server::cache::CacheService;
use docsmith_server::config::BatchSettings;
use docsmith_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use docsmith_server::user::{SqliteUserStore, UserManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Test server instance with isolated databases and worker pool
///
/// When dropped, the server and its workers shut down and temp resources
/// are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Job store for direct database access in tests
    pub job_store: Arc<dyn BatchJobStore>,

    /// User manager for direct user administration in tests
    pub user_manager: Arc<UserManager>,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawns a new test server on a random port with the default
    /// passthrough engine (every file succeeds).
    pub async fn spawn() -> Self {
        Self::spawn_inner(Some(Arc::new(LocalCopyEngine))).await
    }

    /// Spawns a test server whose processor runs the given engine.
    pub async fn spawn_with_engine(engine: Arc<dyn DocumentEngine>) -> Self {
        Self::spawn_inner(Some(engine)).await
    }

    /// Spawns a test server with no worker pool: jobs stay PENDING until
    /// cancelled. Used for deterministic transition-guard tests.
    pub async fn spawn_without_workers() -> Self {
        Self::spawn_inner(None).await
    }

    async fn spawn_inner(engine: Option<Arc<dyn DocumentEngine>>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let user_db_path =
            create_test_db_with_users(temp_dir.path()).expect("Failed to create test database");
        let user_store = Arc::new(SqliteUserStore::new(&user_db_path).expect("open user store"));
        let user_manager = Arc::new(UserManager::new(user_store));

        let job_store: Arc<dyn BatchJobStore> = Arc::new(
            SqliteBatchJobStore::new(temp_dir.path().join("batch_jobs.db"))
                .expect("open job store"),
        );

        // Short claim interval so polling tests converge fast
        let settings = BatchSettings {
            worker_count: 2,
            claim_interval_secs: 1,
            ..Default::default()
        };

        let cache = Arc::new(CacheService::new());
        let spool = Arc::new(UploadSpool::new(
            temp_dir.path().join("spool"),
            settings.max_file_bytes,
        ));
        spool.init().await.expect("init spool");
        let wake = Arc::new(Notify::new());

        let batch_manager = Arc::new(BatchJobManager::new(
            job_store.clone(),
            cache.clone(),
            spool.clone(),
            settings.clone(),
            wake.clone(),
        ));

        let shutdown = CancellationToken::new();

        // Worker pool processing jobs in the background
        if let Some(engine) = engine {
            let processor = Arc::new(BatchProcessor::new(
                job_store.clone(),
                engine,
                spool,
                cache.clone(),
                settings,
                wake,
            ));
            let processor_shutdown = shutdown.clone();
            tokio::spawn(async move { processor.run(processor_shutdown).await });
        }

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            frontend_dir_path: None,
            login_rate_limit: false, // Tests log in in tight loops
            ..Default::default()
        };

        let app = make_app(config, user_manager.clone(), batch_manager, cache)
            .expect("Failed to build app");

        // Spawn server in background task with graceful shutdown
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            job_store,
            user_manager,
            _temp_dir: temp_dir,
            shutdown,
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the home endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Stop the HTTP server and the worker pool
        self.shutdown.cancel();
        // TempDir cleans up automatically
    }
}
