//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all docsmith-server endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde_json::json;
use std::time::Duration;

/// HTTP test client with cookie-based session management
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    /// Creates a new unauthenticated client
    ///
    /// Use this for testing authentication flows.
    /// For most tests, use `authenticated()` instead.
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true) // Automatically handle session cookies
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    /// Creates a client pre-authenticated as the regular test user
    ///
    /// # Panics
    ///
    /// Panics if authentication fails (indicates test infrastructure problem).
    pub async fn authenticated(base_url: String) -> Self {
        Self::authenticated_as(base_url, TEST_USER, TEST_PASS).await
    }

    /// Creates a client pre-authenticated as the given user
    pub async fn authenticated_as(base_url: String, handle: &str, password: &str) -> Self {
        let client = Self::new(base_url);

        let response = client.login(handle, password).await;
        assert_eq!(
            response.status(),
            reqwest::StatusCode::CREATED,
            "Test user authentication failed: {:?}",
            response.text().await
        );

        client
    }

    // ========================================================================
    // Authentication Endpoints
    // ========================================================================

    /// POST /api/auth/login
    pub async fn login(&self, handle: &str, password: &str) -> Response {
        self.client
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&json!({
                "user_handle": handle,
                "password": password,
            }))
            .send()
            .await
            .expect("Login request failed")
    }

    /// GET /api/auth/logout
    pub async fn logout(&self) -> Response {
        self.client
            .get(format!("{}/api/auth/logout", self.base_url))
            .send()
            .await
            .expect("Logout request failed")
    }

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }

    // ========================================================================
    // Batch Job Endpoints
    // ========================================================================

    /// POST /api/batch-jobs with the given named files, all containing
    /// small PDF-looking bytes.
    pub async fn create_job(&self, name: &str, file_names: &[&str]) -> Response {
        self.create_job_with(name, file_names, None, None, None).await
    }

    /// POST /api/batch-jobs with full control over the form fields.
    pub async fn create_job_with(
        &self,
        name: &str,
        file_names: &[&str],
        description: Option<&str>,
        priority: Option<&str>,
        config: Option<&str>,
    ) -> Response {
        let mut form = Form::new().text("jobName", name.to_string());

        if let Some(description) = description {
            form = form.text("description", description.to_string());
        }
        if let Some(priority) = priority {
            form = form.text("priority", priority.to_string());
        }
        if let Some(config) = config {
            form = form.text("config", config.to_string());
        }

        for file_name in file_names {
            let part = Part::bytes(b"%PDF-1.7 test content".to_vec())
                .file_name(file_name.to_string())
                .mime_str("application/pdf")
                .expect("valid mime type");
            form = form.part("files", part);
        }

        self.client
            .post(format!("{}/api/batch-jobs", self.base_url))
            .multipart(form)
            .send()
            .await
            .expect("Create job request failed")
    }

    /// GET /api/batch-jobs?{query}
    pub async fn list_jobs(&self, query: &str) -> Response {
        let url = if query.is_empty() {
            format!("{}/api/batch-jobs", self.base_url)
        } else {
            format!("{}/api/batch-jobs?{}", self.base_url, query)
        };
        self.client
            .get(url)
            .send()
            .await
            .expect("List jobs request failed")
    }

    /// GET /api/batch-jobs/{id}
    pub async fn get_job(&self, id: &str) -> Response {
        self.client
            .get(format!("{}/api/batch-jobs/{}", self.base_url, id))
            .send()
            .await
            .expect("Get job request failed")
    }

    /// PUT /api/batch-jobs/{id}
    pub async fn update_job(&self, id: &str, body: &serde_json::Value) -> Response {
        self.client
            .put(format!("{}/api/batch-jobs/{}", self.base_url, id))
            .json(body)
            .send()
            .await
            .expect("Update job request failed")
    }

    /// PATCH /api/batch-jobs/{id}/toggle
    pub async fn toggle_job(&self, id: &str) -> Response {
        self.client
            .patch(format!("{}/api/batch-jobs/{}/toggle", self.base_url, id))
            .send()
            .await
            .expect("Toggle job request failed")
    }

    /// DELETE /api/batch-jobs/{id}
    pub async fn cancel_job(&self, id: &str) -> Response {
        self.client
            .delete(format!("{}/api/batch-jobs/{}", self.base_url, id))
            .send()
            .await
            .expect("Cancel job request failed")
    }

    /// GET /api/batch-jobs/stats/summary
    pub async fn stats_summary(&self) -> Response {
        self.client
            .get(format!("{}/api/batch-jobs/stats/summary", self.base_url))
            .send()
            .await
            .expect("Stats request failed")
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Creates a job and returns its id, asserting the request is accepted.
    pub async fn create_job_id(&self, name: &str, file_names: &[&str]) -> String {
        let response = self.create_job(name, file_names).await;
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let body: serde_json::Value = response.json().await.expect("job response body");
        body["data"]["id"]
            .as_str()
            .expect("created job has an id")
            .to_string()
    }

    /// Polls the job detail endpoint until the job reaches a terminal
    /// status, returning the final job payload.
    pub async fn wait_for_terminal(&self, id: &str) -> serde_json::Value {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(JOB_TERMINAL_TIMEOUT_MS);

        loop {
            let response = self.get_job(id).await;
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let body: serde_json::Value = response.json().await.expect("job detail body");
            let status = body["data"]["status"].as_str().unwrap_or("").to_string();
            if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
                return body["data"].clone();
            }

            if start.elapsed() > timeout {
                panic!(
                    "Job {} did not reach a terminal status within {}ms (last: {})",
                    id, JOB_TERMINAL_TIMEOUT_MS, status
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
