mod rate_limit;
mod requests_logging;

pub use rate_limit::{rate_limit_error_handler, IpKeyExtractor, LOGIN_BURST, LOGIN_PER_SECOND};
pub use requests_logging::{log_requests, RequestsLoggingLevel};
