use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Closed set of failures produced at the integration boundary.
///
/// Provider clients and the storage layer convert their native errors into
/// this enum where they are first observed, so retry and breaker decisions
/// operate on tagged variants instead of inspecting error strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrationError {
    /// An error that already knows whether it may be retried.
    #[error("{code}: {message}")]
    Structured {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Non-success HTTP response from a remote dependency.
    #[error("http status {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Failure reported by the persistence layer.
    #[error("persistence error ({code}): {message}")]
    Persistence {
        code: PersistenceCode,
        message: String,
    },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// Synthetic rejection from an open circuit breaker. The dependency was not called.
    #[error("circuit open for {dependency}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        dependency: String,
        retry_after_ms: u64,
    },
    /// The in-flight call was dropped before it produced an outcome.
    #[error("call cancelled: {0}")]
    Cancelled(String),
    #[error("{0}")]
    Other(String),
}

impl IntegrationError {
    /// Builds an HTTP error without a provider error code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Human readable message carried by the variant.
    pub fn message(&self) -> &str {
        match self {
            Self::Structured { message, .. }
            | Self::Http { message, .. }
            | Self::Persistence { message, .. } => message,
            Self::Timeout(message)
            | Self::Connection(message)
            | Self::Validation(message)
            | Self::Cancelled(message)
            | Self::Other(message) => message,
            Self::CircuitOpen { dependency, .. } => dependency,
        }
    }

    /// Returns `true` when the failure points at the dependency being
    /// unavailable rather than at the request being wrong.
    ///
    /// This is the default predicate circuit breakers use to decide whether a
    /// failure counts toward opening the circuit.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Persistence { code, .. } => code.is_transient(),
            Self::Structured { retryable, .. } => *retryable,
            Self::Validation(_)
            | Self::CircuitOpen { .. }
            | Self::Cancelled(_)
            | Self::Other(_) => false,
        }
    }

    /// Coarse classification used for logging and metrics labels.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            other if other.is_infrastructure() => ErrorClass::TransientInfrastructure,
            _ => ErrorClass::PermanentRejection,
        }
    }
}

/// Error codes surfaced by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceCode {
    /// A row expected to exist was not found, typically because a concurrent
    /// writer has not committed yet.
    RecordNotFound,
    ConnectionClosed,
    ConnectionTimeout,
    PoolExhausted,
    UniqueViolation,
    ForeignKeyViolation,
    Unknown,
}

impl PersistenceCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordNotFound => "record_not_found",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionTimeout => "connection_timeout",
            Self::PoolExhausted => "pool_exhausted",
            Self::UniqueViolation => "unique_violation",
            Self::ForeignKeyViolation => "foreign_key_violation",
            Self::Unknown => "unknown",
        }
    }

    /// Codes worth retrying after a short delay.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RecordNotFound
                | Self::ConnectionClosed
                | Self::ConnectionTimeout
                | Self::PoolExhausted
        )
    }

    /// Codes caused by the data itself violating a constraint.
    pub fn is_constraint(self) -> bool {
        matches!(self, Self::UniqueViolation | Self::ForeignKeyViolation)
    }
}

impl fmt::Display for PersistenceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome classes for outbound and processing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientInfrastructure,
    PermanentRejection,
    CircuitOpen,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientInfrastructure => "transient_infrastructure",
            Self::PermanentRejection => "permanent_rejection",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_covers_timeouts_and_server_faults() {
        assert!(IntegrationError::Timeout("read".into()).is_infrastructure());
        assert!(IntegrationError::Connection("reset".into()).is_infrastructure());
        assert!(IntegrationError::http(503, "unavailable").is_infrastructure());
        assert!(IntegrationError::http(429, "slow down").is_infrastructure());
    }

    #[test]
    fn caller_errors_are_not_infrastructure() {
        assert!(!IntegrationError::http(400, "invalid address").is_infrastructure());
        assert!(!IntegrationError::Validation("postal code".into()).is_infrastructure());
        assert!(!IntegrationError::Other("mystery".into()).is_infrastructure());
        assert!(!IntegrationError::Persistence {
            code: PersistenceCode::UniqueViolation,
            message: "dup".into(),
        }
        .is_infrastructure());
    }

    #[test]
    fn unknown_errors_classify_as_permanent() {
        let err = IntegrationError::Other("something odd".into());
        assert_eq!(err.class(), ErrorClass::PermanentRejection);

        let open = IntegrationError::CircuitOpen {
            dependency: "shipping".into(),
            retry_after_ms: 10,
        };
        assert_eq!(open.class(), ErrorClass::CircuitOpen);
    }

    #[test]
    fn display_includes_status() {
        let err = IntegrationError::http(502, "bad gateway");
        assert_eq!(err.to_string(), "http status 502: bad gateway");
    }
}
