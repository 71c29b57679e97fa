use thiserror::Error;

use crate::auth::StoreError;

/// Why a credential renewal failed. Cloned to every caller waiting on the
/// same refresh, so it carries no non-cloneable sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh denied: {0}")]
    Denied(String),

    #[error("No refresh token available")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not logged in")]
    AuthRequired,

    #[error("Session expired - refresh denied: {0}")]
    RefreshDenied(String),

    #[error("Session expired - no refresh token available")]
    RefreshUnavailable,

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session storage error: {0}")]
    Store(#[from] StoreError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True for the errors that end the session
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::RefreshDenied(_) | ApiError::RefreshUnavailable)
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Denied(reason) => ApiError::RefreshDenied(reason),
            RefreshError::Unavailable => ApiError::RefreshUnavailable,
        }
    }
}
