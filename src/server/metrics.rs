use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheService;

/// Metric name prefix for all docsmith metrics
const PREFIX: &str = "docsmith";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Authentication Metrics
    pub static ref AUTH_LOGIN_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_auth_login_attempts_total"), "Total login attempts"),
        &["status"]
    ).expect("Failed to create auth_login_attempts_total metric");

    pub static ref AUTH_LOGIN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_auth_login_duration_seconds"),
            "Login request duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0])
    ).expect("Failed to create auth_login_duration_seconds metric");

    // Batch Job Metrics
    pub static ref JOBS_CREATED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_created_total"),
        "Total batch jobs created"
    ).expect("Failed to create jobs_created_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_jobs_finished_total"),
            "Batch jobs that reached a terminal status, by status"
        ),
        &["status"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref FILES_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_files_processed_total"),
            "Job files that reached a terminal status, by status"
        ),
        &["status"]
    ).expect("Failed to create files_processed_total metric");

    // Cache Metrics (gauges refreshed on scrape)
    pub static ref CACHE_HITS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_cache_hits"), "Cache hits per category"),
        &["category"]
    ).expect("Failed to create cache_hits metric");

    pub static ref CACHE_MISSES: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_cache_misses"), "Cache misses per category"),
        &["category"]
    ).expect("Failed to create cache_misses metric");

    pub static ref CACHE_KEYS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_cache_keys"), "Live cache entries per category"),
        &["category"]
    ).expect("Failed to create cache_keys metric");

    // Process Metrics
    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(AUTH_LOGIN_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(AUTH_LOGIN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FILES_PROCESSED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_HITS.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_MISSES.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_KEYS.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Record a login attempt
pub fn record_login_attempt(status: &str, duration: Duration) {
    AUTH_LOGIN_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();

    AUTH_LOGIN_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn record_job_created() {
    JOBS_CREATED_TOTAL.inc();
}

/// Record a job reaching a terminal status
pub fn record_job_finished(status: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
}

/// Record a job file reaching a terminal status
pub fn record_file_processed(status: &str) {
    FILES_PROCESSED_TOTAL.with_label_values(&[status]).inc();
}

/// Refresh the cache gauges from a stats snapshot
pub fn update_cache_metrics(cache: &CacheService) {
    for snapshot in cache.stats(None) {
        CACHE_HITS
            .with_label_values(&[snapshot.category])
            .set(snapshot.hit_count as f64);
        CACHE_MISSES
            .with_label_values(&[snapshot.category])
            .set(snapshot.miss_count as f64);
        CACHE_KEYS
            .with_label_values(&[snapshot.category])
            .set(snapshot.key_count as f64);
    }
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<f64>() {
                            PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                            return;
                        }
                    }
                }
            }
        }
    }

    // Non-Linux systems just don't update the gauge
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler(State(cache): State<Arc<CacheService>>) -> impl IntoResponse {
    update_memory_usage();
    update_cache_metrics(&cache);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serves /metrics on its own port until shutdown.
pub async fn run_metrics_server(
    port: u16,
    cache: Arc<CacheService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(cache);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Metrics available at port {}!", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheCategory;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();

        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_http_request() {
        init_metrics();

        record_http_request(
            "GET",
            "/api/batch-jobs",
            200,
            Duration::from_millis(50),
        );

        let metrics = REGISTRY.gather();
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "docsmith_http_requests_total"));
    }

    #[test]
    fn test_record_job_lifecycle_metrics() {
        init_metrics();

        record_job_created();
        record_job_finished("completed");
        record_file_processed("failed");

        let metrics = REGISTRY.gather();
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "docsmith_jobs_finished_total"));
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "docsmith_files_processed_total"));
    }

    #[test]
    fn test_update_cache_metrics() {
        init_metrics();

        let cache = CacheService::new();
        cache.set(CacheCategory::Jobs, "k", serde_json::json!(1), None);
        cache.get(CacheCategory::Jobs, "k");

        update_cache_metrics(&cache);

        assert_eq!(CACHE_KEYS.with_label_values(&["jobs"]).get(), 1.0);
        assert!(CACHE_HITS.with_label_values(&["jobs"]).get() >= 1.0);
    }
}
