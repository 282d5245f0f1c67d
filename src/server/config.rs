use super::RequestsLoggingLevel;

#[derive(Clone)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    pub frontend_dir_path: Option<String>,
    /// If false, disables the IP rate limit on the login endpoint
    /// (tests exercise login in a tight loop).
    pub login_rate_limit: bool,
    /// Upper bound on a multipart upload request body.
    pub upload_body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            port: 3001,
            frontend_dir_path: None,
            login_rate_limit: true,
            upload_body_limit_bytes: 256 * 1024 * 1024,
        }
    }
}
