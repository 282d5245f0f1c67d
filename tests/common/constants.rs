//! Shared constants for the e2e test suites.

/// Regular test user created by the fixtures
pub const TEST_USER: &str = "test_user";
pub const TEST_PASS: &str = "test_password_123";

/// A second user, for ownership scoping tests
pub const OTHER_USER: &str = "other_user";
pub const OTHER_PASS: &str = "other_password_456";

/// How long to wait for a spawned server to answer on /
pub const SERVER_READY_TIMEOUT_MS: u64 = 5_000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;

/// Per-request timeout for the test client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long to wait for the processor to drive a job to a terminal status
pub const JOB_TERMINAL_TIMEOUT_MS: u64 = 10_000;
