//! Query error taxonomy.
//!
//! Every failure that can reach a caller is one of the variants below.
//! Tool execution still returns `anyhow::Result` (see [`crate::traits::Tool`]);
//! the dispatcher downcasts to [`QueryError`] to pick the machine-readable
//! code and HTTP status, so the envelope is the same on every surface.

use thiserror::Error;

/// Result type for query-layer operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors produced by the routing, SQL, API, and analytics layers.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A parameter was missing, malformed, or out of range.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    /// The operation has no REST equivalent and the database is absent.
    #[error("database connection required for {operation}: {reason}")]
    BackendRequired {
        operation: &'static str,
        reason: String,
    },

    /// Neither backend can serve the operation.
    #[error("no backend available for {0}")]
    BackendUnavailable(&'static str),

    /// The upstream REST API failed.
    #[error("upstream API error: {0}")]
    Upstream(#[from] ApiError),

    /// SQL execution against the primary database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The analytics engine failed or is not configured for the request.
    #[error("analytics engine error: {0}")]
    Analytics(String),

    /// The caller's deadline expired before the backend answered.
    #[error("{0} timed out")]
    Timeout(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl QueryError {
    /// Shorthand for [`QueryError::InvalidParam`].
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Machine-readable error code used in the `{"error": {"code": ...}}` body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParam { .. } => "bad_request",
            Self::BackendRequired { .. } => "backend_required",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Upstream(_) => "upstream_error",
            Self::Database(_) => "database_error",
            Self::Analytics(_) => "analytics_error",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
        }
    }

    /// HTTP status code for the REST boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidParam { .. } => 400,
            Self::NotFound(_) => 404,
            Self::Timeout(_) => 408,
            Self::BackendRequired { .. } | Self::BackendUnavailable(_) => 503,
            Self::Upstream(_) | Self::Database(_) | Self::Analytics(_) => 500,
        }
    }
}

/// Upstream REST API failures, split by where the exchange broke down.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response (DNS, connect, TLS, reset).
    #[error("no response from {url}: {reason}")]
    NoResponse { url: String, reason: String },

    /// The API answered with a non-2xx status.
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// The body could not be decoded into the expected shape.
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}
