//! Routes under /api/batch-jobs.
//!
//! Thin request/response mapping over the batch job manager: every query
//! is scoped by the session's user id, every body is validated here or in
//! the manager, and every response uses the JSON envelope.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::warn;

use crate::batch::{
    JobListFilter, JobListPage, JobMetadataPatch, JobOrderBy, JobPriority, JobStatus,
    NewJobRequest, UploadedFile,
};

use super::envelope;
use super::metrics;
use super::session::Session;
use super::state::{GuardedBatchJobManager, ServerState};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListJobsQuery {
    status: Option<String>,
    priority: Option<String>,
    /// Filters on the job's output format tag
    #[serde(rename = "type")]
    output_format: Option<String>,
    date_from: Option<i64>,
    date_to: Option<i64>,
    search: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
    offset: Option<usize>,
    order_by: Option<String>,
    ascending: Option<bool>,
}

impl ListJobsQuery {
    fn into_filter_and_page(self) -> Result<(JobListFilter, JobListPage), String> {
        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => Some(
                JobStatus::from_db_str(&raw.to_lowercase())
                    .ok_or_else(|| format!("Invalid status filter: {}", raw))?,
            ),
        };
        let priority = match self.priority.as_deref() {
            None => None,
            Some(raw) => Some(
                JobPriority::parse(raw).ok_or_else(|| format!("Invalid priority filter: {}", raw))?,
            ),
        };
        let order_by = match self.order_by.as_deref() {
            None => JobOrderBy::CreatedAt,
            Some(raw) => {
                JobOrderBy::parse(raw).ok_or_else(|| format!("Invalid orderBy column: {}", raw))?
            }
        };

        let filter = JobListFilter {
            status,
            priority,
            output_format: self.output_format,
            date_from: self.date_from,
            date_to: self.date_to,
            search: self.search.filter(|s| !s.trim().is_empty()),
        };

        let page = JobListPage {
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(crate::batch::query::DEFAULT_PAGE_LIMIT),
            offset: self.offset,
            order_by,
            ascending: self.ascending.unwrap_or(false),
        }
        .normalized();

        Ok((filter, page))
    }
}

/// GET /api/batch-jobs
async fn list_jobs(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let (filter, page) = match query.into_filter_and_page() {
        Ok(parsed) => parsed,
        Err(message) => return envelope::error(StatusCode::BAD_REQUEST, message),
    };

    match manager.list_jobs(session.user_id, &filter, &page).await {
        Ok(result) => envelope::ok_paginated(result.jobs, result.pagination),
        Err(err) => envelope::batch_error(err),
    }
}

/// GET /api/batch-jobs/{id}
async fn get_job(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.get_job(session.user_id, &id) {
        Ok(detail) => envelope::ok(detail),
        Err(err) => envelope::batch_error(err),
    }
}

/// POST /api/batch-jobs (multipart/form-data)
async fn create_job(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    mut multipart: Multipart,
) -> Response {
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut config: Option<String> = None;
    let mut priority = JobPriority::default();
    let mut output_format: Option<String> = None;
    let mut files: Vec<UploadedFile> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read multipart field: {}", e);
                return envelope::error(StatusCode::BAD_REQUEST, "Malformed multipart request");
            }
        };

        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "files" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                match field.bytes().await {
                    Ok(bytes) => files.push(UploadedFile {
                        name: file_name,
                        data: bytes.to_vec(),
                    }),
                    Err(e) => {
                        warn!("Failed to read uploaded file: {}", e);
                        return envelope::error(
                            StatusCode::BAD_REQUEST,
                            "Failed to read uploaded file",
                        );
                    }
                }
            }
            "jobName" => {
                if let Ok(bytes) = field.bytes().await {
                    name = Some(String::from_utf8_lossy(&bytes).to_string());
                }
            }
            "description" => {
                if let Ok(bytes) = field.bytes().await {
                    description = Some(String::from_utf8_lossy(&bytes).to_string());
                }
            }
            "config" => {
                if let Ok(bytes) = field.bytes().await {
                    config = Some(String::from_utf8_lossy(&bytes).to_string());
                }
            }
            "priority" => {
                if let Ok(bytes) = field.bytes().await {
                    let raw = String::from_utf8_lossy(&bytes).to_string();
                    match JobPriority::parse(&raw) {
                        Some(parsed) => priority = parsed,
                        None => {
                            return envelope::error(
                                StatusCode::BAD_REQUEST,
                                format!("Invalid priority: {}", raw),
                            )
                        }
                    }
                }
            }
            "outputFormat" => {
                if let Ok(bytes) = field.bytes().await {
                    output_format = Some(String::from_utf8_lossy(&bytes).to_string());
                }
            }
            _ => {}
        }
    }

    let name = match name {
        Some(name) => name,
        None => return envelope::error(StatusCode::BAD_REQUEST, "Job name is required"),
    };

    let request = NewJobRequest {
        name,
        description,
        config,
        priority,
        output_format,
        files,
    };

    match manager.create_job(session.user_id, request).await {
        Ok(job) => {
            metrics::record_job_created();
            envelope::with_status(StatusCode::ACCEPTED, job)
        }
        Err(err) => envelope::batch_error(err),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UpdateJobBody {
    name: Option<String>,
    description: Option<String>,
    config: Option<serde_json::Value>,
    priority: Option<String>,
    output_format: Option<String>,
}

/// PUT /api/batch-jobs/{id}
async fn update_job(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    Path(id): Path<String>,
    Json(body): Json<UpdateJobBody>,
) -> Response {
    let priority = match body.priority.as_deref() {
        None => None,
        Some(raw) => match JobPriority::parse(raw) {
            Some(parsed) => Some(parsed),
            None => {
                return envelope::error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid priority: {}", raw),
                )
            }
        },
    };

    let patch = JobMetadataPatch {
        name: body.name,
        description: body.description,
        config: body.config,
        priority,
        output_format: body.output_format.map(|f| f.to_lowercase()),
    };

    match manager.update_job(session.user_id, &id, patch) {
        Ok(job) => envelope::ok(job),
        Err(err) => envelope::batch_error(err),
    }
}

/// PATCH /api/batch-jobs/{id}/toggle
async fn toggle_job(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.toggle_job(session.user_id, &id) {
        Ok(job) => envelope::ok(job),
        Err(err) => envelope::batch_error(err),
    }
}

/// DELETE /api/batch-jobs/{id} (soft-cancel)
async fn cancel_job(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.cancel_job(session.user_id, &id) {
        Ok(job) => envelope::ok(job),
        Err(err) => envelope::batch_error(err),
    }
}

/// GET /api/batch-jobs/stats/summary
async fn stats_summary(
    session: Session,
    State(manager): State<GuardedBatchJobManager>,
) -> Response {
    match manager.stats_summary(session.user_id).await {
        Ok(stats) => envelope::ok(stats),
        Err(err) => envelope::batch_error(err),
    }
}

pub fn make_batch_routes(state: ServerState) -> Router {
    let upload_body_limit = state.config.upload_body_limit_bytes;
    Router::new()
        .route("/", get(list_jobs))
        .route(
            "/",
            post(create_job).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/stats/summary", get(stats_summary))
        .route("/{id}", get(get_job))
        .route("/{id}", put(update_job))
        .route("/{id}/toggle", patch(toggle_job))
        .route("/{id}", delete(cancel_job))
        .with_state(state)
}
