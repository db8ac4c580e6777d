//! Request identity.
//!
//! The bearer token is the caller's user id. Session validation happens in
//! front of this service; by the time a request arrives here the token has
//! already been vouched for.

use axum::http::HeaderMap;
use thiserror::Error;


/// User id used for every request when auth is disabled.
pub const DEFAULT_USER: &str = "default";

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BearerError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(BearerError::Missing)?
        .to_str()
        .map_err(|_| BearerError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Resolves the user a request acts for.
pub fn resolve_user(headers: &HeaderMap, auth_enabled: bool) -> Result<String, BearerError> {
    if auth_enabled {
        extract_bearer_token(headers)
    } else {
        Ok(DEFAULT_USER.to_string())
    }
}

fn parse_bearer_token(header_value: &str) -> Result<String, BearerError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(BearerError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(BearerError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(BearerError::Empty);
    }

    Ok(token.to_string())
}

/// Bearer extraction errors
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BearerError {
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}
