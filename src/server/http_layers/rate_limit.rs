//! Rate limiting for the login endpoint using tower-governor.
//!
//! Login is limited per source IP to slow down credential brute force.
//! The governor layer itself is assembled in server.rs; this module keeps
//! the limits, the key extractor and the error handler.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tower_governor::{key_extractor::KeyExtractor, GovernorError};
use tracing::warn;

/// Sustained login attempts per second per IP
pub const LOGIN_PER_SECOND: u64 = 1;

/// Login burst size per IP
pub const LOGIN_BURST: u32 = 10;

/// Extracts the client IP from ConnectInfo for IP-based rate limiting
#[derive(Clone)]
pub struct IpKeyExtractor;

impl KeyExtractor for IpKeyExtractor {
    type Key = SocketAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

/// Logs rate limit violations and maps them onto plain status responses.
pub fn rate_limit_error_handler(err: GovernorError) -> Response<Body> {
    match err {
        GovernorError::TooManyRequests { .. } => {
            warn!("Login rate limit exceeded");
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
        _ => {
            warn!("Rate limiting error: {:?}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
