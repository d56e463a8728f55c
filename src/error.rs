//! Error types for objserv-exporter
//!
//! This module defines the error types used throughout the application.
//! Scrape failures never surface as HTTP errors; they are folded into the
//! `up` meta-metric and the per-query error counters instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors returned by a [`Connection`](crate::connection::Connection) implementation
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// 연결 수립 실패
    #[error("Connection failed: {0}")]
    Connect(String),

    /// 프로토콜 수준 에러 (세션 상태를 신뢰할 수 없음)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 서버가 쿼리를 거부함 (문법 오류, 권한 없음 등)
    #[error("Query rejected: {0}")]
    Query(String),
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ConnectionError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ConnectionError::Protocol(format!("malformed response: {}", err))
        } else {
            ConnectionError::Protocol(err.to_string())
        }
    }
}

/// Scrape failure taxonomy
///
/// Connection-level variants abort the whole scrape of a target, query-level
/// variants are isolated to one query, row-level variants drop a single row.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScrapeError {
    /// No pooled connection became available before the deadline
    #[error("Connection pool for target '{target}' exhausted after {waited_ms}ms")]
    PoolExhausted { target: String, waited_ms: u64 },

    /// Could not open a usable connection
    #[error("Failed to connect to target '{target}' after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// Protocol-level failure; taints the connection it happened on
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Query exceeded the scrape deadline.
    /// The value is the remaining budget in milliseconds when the query started, if known.
    /// `Some(0)` means the deadline had passed before the query was sent.
    #[error("Query timed out{}", .0.map(|ms| format!(" after {}ms", ms)).unwrap_or_default())]
    Timeout(Option<u64>),

    /// The server rejected the query
    #[error("Query error: {0}")]
    Query(String),

    /// The value column could not be read as a number
    #[error("Column '{column}' value {value} is not numeric")]
    ValueCoercion { column: String, value: String },

    /// Two samples with the same identity in one scrape
    #[error("Duplicate series {metric}{labels}")]
    DuplicateSeries { metric: String, labels: String },
}

impl ScrapeError {
    /// Whether the connection the error happened on must be destroyed on release
    ///
    /// A query that never reached the connection leaves it untouched.
    pub fn is_connection_tainting(&self) -> bool {
        match self {
            ScrapeError::Protocol(_) => true,
            ScrapeError::Timeout(budget_ms) => *budget_ms != Some(0),
            _ => false,
        }
    }

    /// Whether the error aborts the whole scrape of a target
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ScrapeError::PoolExhausted { .. } | ScrapeError::ConnectFailed { .. }
        )
    }

    /// Stable identifier used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::PoolExhausted { .. } => "pool_exhausted",
            ScrapeError::ConnectFailed { .. } => "connect_failed",
            ScrapeError::Protocol(_) => "protocol_error",
            ScrapeError::Timeout(_) => "timeout",
            ScrapeError::Query(_) => "query_error",
            ScrapeError::ValueCoercion { .. } => "value_coercion",
            ScrapeError::DuplicateSeries { .. } => "duplicate_series",
        }
    }

    /// Create a Timeout error with known duration
    pub fn timeout_with_duration(ms: u64) -> Self {
        ScrapeError::Timeout(Some(ms))
    }
}

impl From<ConnectionError> for ScrapeError {
    fn from(err: ConnectionError) -> Self {
        match err {
            // A connect error in the middle of a query means the session is gone
            ConnectionError::Connect(msg) | ConnectionError::Protocol(msg) => {
                ScrapeError::Protocol(msg)
            }
            ConnectionError::Query(msg) => ScrapeError::Query(msg),
        }
    }
}

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Requested target is not configured
    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    /// No target in the request and no default configured
    #[error("No target specified and no default target configured")]
    MissingTarget,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, public_message) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error"),
            AppError::UnknownTarget(_) => (StatusCode::NOT_FOUND, "Target not found"),
            AppError::MissingTarget => (StatusCode::BAD_REQUEST, "Target parameter missing"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };

        tracing::error!(status = %status, error = %self, "Request failed");

        (status, public_message).into_response()
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;
