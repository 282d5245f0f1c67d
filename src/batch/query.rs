//! Filter and pagination helpers for job listing queries.
//!
//! Builds the WHERE clause and parameter list shared by the page query and
//! the matching COUNT query, so both always agree on what is being counted.

use serde::{Deserialize, Serialize};

use super::models::{JobPriority, JobStatus};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

/// Conjunctive filters for job listings. Absent fields are no-ops.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    /// Filters on the job's output format tag
    pub output_format: Option<String>,
    /// Inclusive created_at lower bound (unix seconds)
    pub date_from: Option<i64>,
    /// Inclusive created_at upper bound (unix seconds)
    pub date_to: Option<i64>,
    /// Case-insensitive substring match over name OR description
    pub search: Option<String>,
}

impl JobListFilter {
    /// Builds the WHERE clause (without the leading keyword) and its
    /// parameters. Always scopes to the owning user first.
    pub fn where_clause(&self, user_id: i64) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut clauses: Vec<String> = vec!["user_id = ?".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id)];

        if let Some(status) = self.status {
            clauses.push("status = ?".to_string());
            params.push(Box::new(status.as_db_str().to_string()));
        }
        if let Some(priority) = self.priority {
            clauses.push("priority = ?".to_string());
            params.push(Box::new(priority.as_i32()));
        }
        if let Some(format) = &self.output_format {
            clauses.push("output_format = ?".to_string());
            params.push(Box::new(format.clone()));
        }
        if let Some(from) = self.date_from {
            clauses.push("created_at >= ?".to_string());
            params.push(Box::new(from));
        }
        if let Some(to) = self.date_to {
            clauses.push("created_at <= ?".to_string());
            params.push(Box::new(to));
        }
        if let Some(search) = &self.search {
            let needle = format!("%{}%", search.to_lowercase());
            clauses.push(
                "(LOWER(name) LIKE ? OR LOWER(IFNULL(description, '')) LIKE ?)".to_string(),
            );
            params.push(Box::new(needle.clone()));
            params.push(Box::new(needle));
        }

        (clauses.join(" AND "), params)
    }

    /// Key/value pairs describing this filter, used for cache key derivation.
    pub fn key_params(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = self.status {
            pairs.push(("status", status.as_db_str().to_string()));
        }
        if let Some(priority) = self.priority {
            pairs.push(("priority", priority.as_i32().to_string()));
        }
        if let Some(format) = &self.output_format {
            pairs.push(("format", format.clone()));
        }
        if let Some(from) = self.date_from {
            pairs.push(("from", from.to_string()));
        }
        if let Some(to) = self.date_to {
            pairs.push(("to", to.to_string()));
        }
        if let Some(search) = &self.search {
            pairs.push(("search", search.to_lowercase()));
        }
        pairs
    }
}

/// Sort column for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrderBy {
    CreatedAt,
    UpdatedAt,
    Name,
    Priority,
    Status,
}

impl JobOrderBy {
    pub fn as_column(&self) -> &'static str {
        match self {
            JobOrderBy::CreatedAt => "created_at",
            JobOrderBy::UpdatedAt => "updated_at",
            JobOrderBy::Name => "name",
            JobOrderBy::Priority => "priority",
            JobOrderBy::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "created_at" | "created" => Some(JobOrderBy::CreatedAt),
            "updated_at" | "updated" => Some(JobOrderBy::UpdatedAt),
            "name" => Some(JobOrderBy::Name),
            "priority" => Some(JobOrderBy::Priority),
            "status" => Some(JobOrderBy::Status),
            _ => None,
        }
    }
}

/// Page request: 1-indexed page plus bounded limit. An explicit offset
/// (legacy clients) wins over the page number when present.
#[derive(Debug, Clone)]
pub struct JobListPage {
    pub page: usize,
    pub limit: usize,
    pub offset: Option<usize>,
    pub order_by: JobOrderBy,
    pub ascending: bool,
}

impl Default for JobListPage {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            offset: None,
            order_by: JobOrderBy::CreatedAt,
            ascending: false,
        }
    }
}

impl JobListPage {
    /// Clamps page/limit into sane bounds.
    pub fn normalized(mut self) -> Self {
        if self.page == 0 {
            self.page = 1;
        }
        if self.limit == 0 {
            self.limit = DEFAULT_PAGE_LIMIT;
        }
        self.limit = self.limit.min(MAX_PAGE_LIMIT);
        self
    }

    pub fn resolved_offset(&self) -> usize {
        self.offset.unwrap_or((self.page - 1) * self.limit)
    }

    pub fn order_clause(&self) -> String {
        format!(
            "ORDER BY {} {}",
            self.order_by.as_column(),
            if self.ascending { "ASC" } else { "DESC" }
        )
    }

    pub fn key_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("page", self.page.to_string()),
            ("limit", self.limit.to_string()),
            ("offset", self.resolved_offset().to_string()),
            ("order", self.order_by.as_column().to_string()),
            ("asc", self.ascending.to_string()),
        ]
    }
}

/// Pagination metadata returned alongside list results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl PaginationMeta {
    pub fn new(page: &JobListPage, total: usize) -> Self {
        Self {
            page: page.page,
            limit: page.limit,
            total,
            total_pages: total.div_ceil(page.limit.max(1)),
        }
    }
}

/// Derives an order-independent cache key for a list query: the same
/// filters in any order produce the same key.
pub fn list_cache_key(user_id: i64, filter: &JobListFilter, page: &JobListPage) -> String {
    let mut pairs = filter.key_params();
    pairs.extend(page.key_params());
    pairs.sort();

    let mut key = format!("jobs:{}", user_id);
    for (k, v) in pairs {
        key.push_str(&format!(":{}={}", k, v));
    }
    key
}
