use anyhow::Result;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{error, info};

use crate::batch::BatchJobManager;
use crate::cache::CacheService;
use crate::user::{AuthTokenValue, UserManager};
use axum_extra::extract::cookie::{Cookie, SameSite};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use axum::{
    body::Body,
    extract::State,
    http::{response, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use super::batch_routes::make_batch_routes;
use super::http_layers::{
    log_requests, rate_limit_error_handler, IpKeyExtractor, LOGIN_BURST, LOGIN_PER_SECOND,
};
use super::session::Session;
use super::state::*;
use super::{envelope, metrics, ServerConfig};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub session_token: Option<String>,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug)]
struct LoginBody {
    pub user_handle: String,
    pub password: String,
}

async fn home(session: Option<Session>, State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        session_token: session.map(|s| s.token),
    };
    Json(stats)
}

async fn login(
    State(user_manager): State<GuardedUserManager>,
    Json(body): Json<LoginBody>,
) -> Response {
    let start = Instant::now();

    let token = match user_manager.login(&body.user_handle, &body.password) {
        Ok(Some(token)) => token,
        Ok(None) => {
            metrics::record_login_attempt("failure", start.elapsed());
            return envelope::error(StatusCode::UNAUTHORIZED, "Invalid credentials");
        }
        Err(err) => {
            error!("Error during login of {}: {}", body.user_handle, err);
            metrics::record_login_attempt("error", start.elapsed());
            return envelope::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    metrics::record_login_attempt("success", start.elapsed());

    let body = serde_json::json!({
        "success": true,
        "data": { "token": token.value.0 },
    });
    let cookie_value = HeaderValue::from_str(&format!(
        "session_token={}; Path=/; HttpOnly",
        token.value.0
    ))
    .expect("token is always a valid header value");

    response::Builder::new()
        .status(StatusCode::CREATED)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .header(axum::http::header::SET_COOKIE, cookie_value)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn logout(State(user_manager): State<GuardedUserManager>, session: Session) -> Response {
    match user_manager.delete_auth_token(session.user_id, &AuthTokenValue(session.token)) {
        Ok(()) => {
            let cookie_value = Cookie::build(Cookie::new("session_token", ""))
                .path("/")
                .expires(time::OffsetDateTime::now_utc() - time::Duration::days(1)) // Expire it in the past
                .same_site(SameSite::Lax)
                .build();

            response::Builder::new()
                .status(StatusCode::OK)
                .header(axum::http::header::SET_COOKIE, cookie_value.to_string())
                .body(Body::empty())
                .unwrap()
        }
        Err(_) => envelope::error(StatusCode::BAD_REQUEST, "Invalid session"),
    }
}

pub fn make_app(
    config: ServerConfig,
    user_manager: Arc<UserManager>,
    batch_manager: Arc<BatchJobManager>,
    cache: Arc<CacheService>,
) -> Result<Router> {
    let state = ServerState {
        config: config.clone(),
        start_time: Instant::now(),
        user_manager,
        batch_manager,
        cache,
        hash: env!("GIT_HASH").to_owned(),
    };

    let mut login_routes: Router = Router::new()
        .route("/login", post(login))
        .with_state(state.clone());
    if config.login_rate_limit {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(LOGIN_PER_SECOND)
                .burst_size(LOGIN_BURST)
                .key_extractor(IpKeyExtractor)
                .finish()
                .expect("valid login rate limit configuration"),
        );
        login_routes = login_routes.layer(
            GovernorLayer::new(governor_conf).error_handler(rate_limit_error_handler),
        );
    }

    let auth_routes: Router = login_routes.merge(
        Router::new()
            .route("/logout", get(logout))
            .with_state(state.clone()),
    );

    let batch_routes = make_batch_routes(state.clone());

    let home_router: Router = match &config.frontend_dir_path {
        Some(frontend_path) => {
            let static_files_service =
                ServeDir::new(frontend_path).append_index_html_on_directories(true);
            Router::new().fallback_service(static_files_service)
        }
        None => Router::new()
            .route("/", get(home))
            .with_state(state.clone()),
    };

    let mut app: Router = home_router
        .nest("/api/auth", auth_routes)
        .nest("/api/batch-jobs", batch_routes);

    app = app.layer(middleware::from_fn_with_state(state.clone(), log_requests));

    Ok(app)
}

pub async fn run_server(
    config: ServerConfig,
    user_manager: Arc<UserManager>,
    batch_manager: Arc<BatchJobManager>,
    cache: Arc<CacheService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(config, user_manager, batch_manager, cache)?;

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Ready to serve at port {}!", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{SqliteBatchJobStore, UploadSpool};
    use crate::config::BatchSettings;
    use crate::user::SqliteUserStore;
    use axum::http::Request;
    use tokio::sync::Notify;
    use tower::ServiceExt; // for `oneshot`

    fn make_test_app() -> (Router, Arc<UserManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let user_manager = Arc::new(UserManager::new(Arc::new(
            SqliteUserStore::in_memory().unwrap(),
        )));

        let settings = BatchSettings::default();
        let cache = Arc::new(CacheService::new());
        let batch_manager = Arc::new(BatchJobManager::new(
            Arc::new(SqliteBatchJobStore::in_memory().unwrap()),
            cache.clone(),
            Arc::new(UploadSpool::new(dir.path(), settings.max_file_bytes)),
            settings,
            Arc::new(Notify::new()),
        ));

        let config = ServerConfig {
            requests_logging_level: super::super::RequestsLoggingLevel::None,
            login_rate_limit: false,
            ..Default::default()
        };
        let app = make_app(config, user_manager.clone(), batch_manager, cache).unwrap();
        (app, user_manager, dir)
    }

    #[tokio::test]
    async fn responds_unauthorized_on_protected_routes() {
        let (app, _, _dir) = make_test_app();

        let protected_routes = vec![
            ("GET", "/api/batch-jobs"),
            ("GET", "/api/batch-jobs/123"),
            ("PATCH", "/api/batch-jobs/123/toggle"),
            ("DELETE", "/api/batch-jobs/123"),
            ("GET", "/api/batch-jobs/stats/summary"),
            ("GET", "/api/auth/logout"),
        ];

        for (method, route) in protected_routes.into_iter() {
            let request = Request::builder()
                .method(method)
                .uri(route)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "{} {} should require a session",
                method,
                route
            );
        }
    }

    #[tokio::test]
    async fn home_reports_uptime_and_hash() {
        let (app, _, _dir) = make_test_app();

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(stats.get("uptime").is_some());
        assert!(stats.get("hash").is_some());
    }

    #[tokio::test]
    async fn login_rejects_unknown_user() {
        let (app, _, _dir) = make_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"user_handle": "ghost", "password": "pw"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_issues_usable_token() {
        let (app, user_manager, _dir) = make_test_app();
        user_manager.add_user("ada").unwrap();
        user_manager
            .create_password_credentials("ada", "hunter2".to_string())
            .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"user_handle": "ada", "password": "hunter2"}).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("set-cookie").is_some());

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        let token = body["data"]["token"].as_str().unwrap().to_string();

        // The token works through the Authorization header
        let request = Request::builder()
            .uri("/api/batch-jobs")
            .header("Authorization", &token)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
