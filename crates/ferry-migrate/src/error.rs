//! Error types for migration operations.

use crate::types::MigrationReport;
use thiserror::Error;

/// Which side of the migration an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// The platform repositories are read from.
    Source,
    /// The platform repositories are imported into.
    Target,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Credentials were rejected by a platform.
    #[error("Authentication with {platform} platform failed: {message}")]
    AuthenticationFailed { platform: Platform, message: String },

    /// Resource not found on a platform.
    #[error("Not found: {0}")]
    NotFound(String),

    /// API request failed with a non-success status.
    #[error("API request failed ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded, retry after {0} seconds")]
    RateLimitExceeded(u64),

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Reading the source inventory failed; nothing was migrated.
    #[error("Inventory collection failed: {0}")]
    CollectionFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected response payload.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The run stopped before every unit was attempted.
    #[error("Migration aborted: {reason}")]
    Aborted {
        reason: String,
        report: Box<MigrationReport>,
    },

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl MigrationError {
    /// Build an error from a non-success HTTP status and response body.
    pub fn from_status(platform: Platform, status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed {
                platform,
                message: format!("status {status}: {body}"),
            },
            404 => Self::NotFound(body),
            429 => Self::RateLimitExceeded(0),
            _ => Self::ApiError {
                status,
                message: body,
            },
        }
    }

    /// Build an error from a non-success response.
    ///
    /// A 429 carries the `Retry-After` seconds when the server sent them.
    pub(crate) async fn from_response(platform: Platform, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0);
            return Self::RateLimitExceeded(retry_after);
        }
        let body = response.text().await.unwrap_or_default();
        Self::from_status(platform, status, body)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::RateLimitExceeded(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the error is a rejected credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::NetworkError(e.to_string())
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;
