//! Failure taxonomy for load test runs.
//!
//! Every request that does not succeed ends up as exactly one
//! [`FailureReason`]. Endpoint failures are further classified by
//! [`ErrorCategory`] so a report can tell server errors from network trouble,
//! and generator-side failures (saturation, drain timeout, cancellation) are
//! kept apart from anything the target did.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Categories of endpoint errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// Unexpected status outside the error ranges, or anything unclassified
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns None for 2xx/3xx. Whether such a status counts as a success is
    /// decided by the scenario's expected status, not here.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode()
        {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let error_msg = error.to_string().to_lowercase();

            if error_msg.contains("certificate")
                || error_msg.contains("tls")
                || error_msg.contains("ssl")
            {
                ErrorCategory::TlsError
            } else if error_msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if error_msg.contains("dns") || error_msg.contains("connect") {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Short label used in metrics and reports.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An endpoint error with its category and, when there was one, the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub message: String,
}

impl CategorizedError {
    /// Error for a response whose status was not the expected one.
    pub fn unexpected_status(status_code: u16, expected: u16) -> Self {
        Self {
            category: ErrorCategory::from_status_code(status_code)
                .unwrap_or(ErrorCategory::OtherError),
            status_code: Some(status_code),
            message: format!("expected status {}, got {}", expected, status_code),
        }
    }

    /// Error for a failed transport call.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        Self {
            category: ErrorCategory::from_reqwest_error(error),
            status_code: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status_code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{}] HTTP {}: {}", self.category, status, self.message),
            None => write!(f, "[{}] {}", self.category, self.message),
        }
    }
}

/// Why a sample counts as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker pool was at `max_workers` with every worker busy. This is
    /// a load generator capacity problem, not a target problem.
    PoolSaturated,

    /// The target answered with an unexpected status or the transport failed.
    Endpoint(CategorizedError),

    /// The request was still in flight when the drain grace period ran out.
    DrainTimeout,

    /// The pool was torn down while the request was in flight.
    Cancelled,
}

impl FailureReason {
    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::PoolSaturated => FailureKind::PoolSaturated,
            FailureReason::Endpoint(_) => FailureKind::Endpoint,
            FailureReason::DrainTimeout => FailureKind::DrainTimeout,
            FailureReason::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Endpoint(err) => write!(f, "endpoint error {}", err),
            other => f.write_str(other.kind().label()),
        }
    }
}

/// Fieldless view of [`FailureReason`], used for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PoolSaturated,
    Endpoint,
    DrainTimeout,
    Cancelled,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::PoolSaturated => "pool_saturated",
            FailureKind::Endpoint => "endpoint_error",
            FailureKind::DrainTimeout => "drain_timeout",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn all() -> [FailureKind; 4] {
        [
            FailureKind::PoolSaturated,
            FailureKind::Endpoint,
            FailureKind::DrainTimeout,
            FailureKind::Cancelled,
        ]
    }
}

/// Invalid run configuration. Always raised before any scenario starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Ramp plan must contain at least one stage")]
    EmptyPlan,

    #[error("Stage {index}: duration must be positive, got {duration_secs}s")]
    NonPositiveStageDuration { index: usize, duration_secs: f64 },

    #[error("Stage {index}: target rate must be a finite non-negative number, got {rate}")]
    InvalidStageRate { index: usize, rate: f64 },

    #[error("Start rate must be a finite non-negative number, got {0}")]
    InvalidStartRate(f64),

    #[error("Scenario '{scenario}': {message}")]
    InvalidScenario { scenario: String, message: String },

    #[error("Duplicate scenario name '{0}'")]
    DuplicateScenario(String),

    #[error("At least one scenario must be defined")]
    NoScenarios,

    #[error("Invalid threshold '{expression}': {message}")]
    InvalidThreshold { expression: String, message: String },

    #[error("Invalid setting {field}: {message}")]
    InvalidSetting { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_success_codes() {
        assert_eq!(ErrorCategory::from_status_code(200), None);
        assert_eq!(ErrorCategory::from_status_code(204), None);
        assert_eq!(ErrorCategory::from_status_code(302), None);
    }

    #[test]
    fn test_categorize_error_codes() {
        assert_eq!(
            ErrorCategory::from_status_code(429),
            Some(ErrorCategory::ClientError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(502),
            Some(ErrorCategory::ServerError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(999),
            Some(ErrorCategory::OtherError)
        );
    }

    #[test]
    fn test_unexpected_status_keeps_category() {
        let err = CategorizedError::unexpected_status(503, 200);
        assert_eq!(err.category, ErrorCategory::ServerError);
        assert_eq!(err.status_code, Some(503));
        assert!(err.to_string().contains("HTTP 503"));

        // a 204 is not an HTTP error, but it is not what we asked for either
        let err = CategorizedError::unexpected_status(204, 200);
        assert_eq!(err.category, ErrorCategory::OtherError);
    }

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureReason::PoolSaturated.kind().label(), "pool_saturated");
        assert_eq!(FailureReason::DrainTimeout.to_string(), "drain_timeout");
        let endpoint = FailureReason::Endpoint(CategorizedError::new(
            ErrorCategory::NetworkError,
            "connection refused",
        ));
        assert_eq!(endpoint.kind(), FailureKind::Endpoint);
        assert!(endpoint.to_string().contains("connection refused"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NonPositiveStageDuration {
            index: 2,
            duration_secs: 0.0,
        };
        assert_eq!(err.to_string(), "Stage 2: duration must be positive, got 0s");
    }
}
