//! Database schema for batch_jobs.db.
//!
//! Defines versioned schema migrations for the batch job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

/// Batch jobs table
const BATCH_JOBS_TABLE_V1: Table = Table {
    name: "batch_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("description", &SqlType::Text),
        sqlite_column!("config", &SqlType::Text),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("output_format", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("total_files", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "processed_files",
            &SqlType::Integer,
            default_value = Some("0")
        ),
        sqlite_column!("failed_files", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_jobs_user", "user_id"),
        ("idx_jobs_user_status", "user_id, status"),
        ("idx_jobs_status_priority", "status, priority, created_at"),
        ("idx_jobs_created", "created_at"),
    ],
    unique_constraints: &[],
};

/// Per-file records, one row per input file of a job
const BATCH_JOB_FILES_TABLE_V1: Table = Table {
    name: "batch_job_files",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "batch_jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("file_order", &SqlType::Integer, non_null = true),
        sqlite_column!("file_name", &SqlType::Text, non_null = true),
        sqlite_column!("file_type", &SqlType::Text, non_null = true),
        sqlite_column!("size_bytes", &SqlType::Integer, non_null = true),
        sqlite_column!("checksum_sha256", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_job_files_job", "job_id"),
        ("idx_job_files_status", "status"),
    ],
    unique_constraints: &[&["job_id", "file_order"]],
};

pub const BATCH_JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[BATCH_JOBS_TABLE_V1, BATCH_JOB_FILES_TABLE_V1],
    migration: None,
}];
