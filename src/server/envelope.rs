//! JSON response envelope: `{ success, data?, error?, pagination? }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::batch::{BatchJobError, PaginationMeta};

#[derive(Serialize)]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
}

pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    let envelope = ApiEnvelope {
        success: true,
        data: Some(serde_json::to_value(data).expect("serializable response data")),
        error: None,
        pagination: None,
    };
    (status, Json(envelope)).into_response()
}

pub fn ok_paginated<T: Serialize>(data: T, pagination: PaginationMeta) -> Response {
    let envelope = ApiEnvelope {
        success: true,
        data: Some(serde_json::to_value(data).expect("serializable response data")),
        error: None,
        pagination: Some(pagination),
    };
    (StatusCode::OK, Json(envelope)).into_response()
}

pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    let envelope = ApiEnvelope {
        success: false,
        data: None,
        error: Some(message.into()),
        pagination: None,
    };
    (status, Json(envelope)).into_response()
}

/// Maps manager errors onto the envelope: validation and invalid-state
/// conflicts are 400, missing or foreign jobs are 404, the rest is 500
/// with the detail kept out of the response body.
pub fn batch_error(err: BatchJobError) -> Response {
    match err {
        BatchJobError::Validation(message) => error(StatusCode::BAD_REQUEST, message),
        BatchJobError::InvalidState(message) => error(StatusCode::BAD_REQUEST, message),
        BatchJobError::NotFound => error(StatusCode::NOT_FOUND, "Job not found"),
        BatchJobError::Internal(e) => {
            tracing::error!("Internal error handling batch job request: {:#}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
