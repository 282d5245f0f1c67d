use super::envelope;
use super::state::ServerState;
use crate::user::auth::AuthTokenValue;

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::debug;

#[derive(Debug)]
pub struct Session {
    pub user_id: i64,
    pub token: String,
}

pub const COOKIE_SESSION_TOKEN_KEY: &str = "session_token";
pub const HEADER_SESSION_TOKEN_KEY: &str = "Authorization";

pub enum SessionExtractionError {
    AccessDenied,
}

impl IntoResponse for SessionExtractionError {
    fn into_response(self) -> axum::response::Response {
        match self {
            SessionExtractionError::AccessDenied => {
                envelope::error(StatusCode::UNAUTHORIZED, "Authentication required")
            }
        }
    }
}

async fn extract_session_token_from_cookies(
    parts: &mut Parts,
    ctx: &ServerState,
) -> Option<String> {
    CookieJar::from_request_parts(parts, &ctx)
        .await
        .expect("Could not read cookies into CookieJar.")
        .get(COOKIE_SESSION_TOKEN_KEY)
        .map(Cookie::value)
        .map(|s| s.to_string())
}

fn extract_session_token_from_headers(parts: &mut Parts) -> Option<String> {
    parts
        .headers
        .get(HEADER_SESSION_TOKEN_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").to_string())
}

async fn extract_session_from_request_parts(
    parts: &mut Parts,
    ctx: &ServerState,
) -> Option<Session> {
    let token = match extract_session_token_from_cookies(parts, ctx)
        .await
        .or_else(|| extract_session_token_from_headers(parts))
    {
        None => {
            debug!("No session token in cookies nor headers.");
            return None;
        }
        Some(x) => x,
    };

    let auth_token_value = AuthTokenValue(token);
    let auth_token = match ctx.user_manager.get_auth_token(&auth_token_value) {
        Ok(Some(token)) => {
            if let Err(e) = ctx
                .user_manager
                .update_auth_token_last_used(&auth_token_value)
            {
                // Not critical for authentication
                debug!("Failed to update auth token last_used timestamp: {}", e);
            }
            token
        }
        Ok(None) => {
            debug!("Session token not found in database");
            return None;
        }
        Err(e) => {
            debug!("Failed to look up session token: {}", e);
            return None;
        }
    };

    Some(Session {
        user_id: auth_token.user_id,
        token: auth_token.value.0,
    })
}

impl FromRequestParts<ServerState> for Session {
    type Rejection = SessionExtractionError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        extract_session_from_request_parts(parts, ctx)
            .await
            .ok_or(SessionExtractionError::AccessDenied)
    }
}

impl OptionalFromRequestParts<ServerState> for Session {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(extract_session_from_request_parts(parts, ctx).await)
    }
}
