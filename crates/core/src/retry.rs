use serde::Serialize;
use tracing::debug;

use crate::envelope::is_payment_event_type;
use crate::error::{IntegrationError, PersistenceCode};

const PERMANENT_PATTERNS: &[&str] =
    &["merchant mismatch", "unauthorized", "forbidden", "not owned"];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "econnrefused",
    "connection reset",
    "socket hang up",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCategory {
    NoError,
    Flagged,
    CircuitOpen,
    PermanentRejection,
    RateLimited,
    ServerFault,
    RaceCondition,
    Connection,
    Timeout,
    Validation,
    Constraint,
    Unknown,
}

impl RetryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoError => "no_error",
            Self::Flagged => "flagged",
            Self::CircuitOpen => "circuit_open",
            Self::PermanentRejection => "permanent_rejection",
            Self::RateLimited => "rate_limited",
            Self::ServerFault => "server_fault",
            Self::RaceCondition => "race_condition",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Constraint => "constraint",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub reason: String,
    pub category: RetryCategory,
}

impl RetryDecision {
    fn retry(category: RetryCategory, delay_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            delay_ms,
            reason: reason.into(),
            category,
        }
    }

    fn deny(category: RetryCategory, reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
            reason: reason.into(),
            category,
        }
    }
}

/// Fixed delays per failure category, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelays {
    pub timeout_ms: u64,
    pub connection_ms: u64,
    pub rate_limit_ms: u64,
    pub race_condition_ms: u64,
    pub server_fault_ms: u64,
    pub payment_server_fault_ms: u64,
    pub default_ms: u64,
}

impl Default for RetryDelays {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            connection_ms: 1_000,
            rate_limit_ms: 3_000,
            race_condition_ms: 2_000,
            server_fault_ms: 2_000,
            payment_server_fault_ms: 1_500,
            default_ms: 2_000,
        }
    }
}

/// Total classifier: every input yields a decision, and anything it does not
/// recognise is denied.
#[derive(Debug, Clone, Default)]
pub struct RetryClassifier {
    delays: RetryDelays,
}

impl RetryClassifier {
    pub fn new(delays: RetryDelays) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &RetryDelays {
        &self.delays
    }

    /// Decides whether processing of `event_type` should be retried after `error`.
    pub fn classify(&self, error: Option<&IntegrationError>, event_type: &str) -> RetryDecision {
        let decision = self.decide(error, event_type);
        debug!(
            stage = "retry",
            event_type,
            category = decision.category.as_str(),
            should_retry = decision.should_retry,
            delay_ms = decision.delay_ms,
            "classified failure"
        );
        decision
    }

    fn decide(&self, error: Option<&IntegrationError>, event_type: &str) -> RetryDecision {
        let Some(error) = error else {
            return RetryDecision::deny(RetryCategory::NoError, "no error to retry");
        };
        let payment = is_payment_event_type(event_type);
        let delays = &self.delays;

        match error {
            IntegrationError::Structured {
                code, retryable, ..
            } => {
                return if *retryable {
                    RetryDecision::retry(
                        RetryCategory::Flagged,
                        delays.default_ms,
                        format!("{code} is flagged retryable"),
                    )
                } else {
                    RetryDecision::deny(
                        RetryCategory::Flagged,
                        format!("{code} is flagged permanent"),
                    )
                };
            }
            IntegrationError::CircuitOpen {
                dependency,
                retry_after_ms,
            } => {
                return RetryDecision::retry(
                    RetryCategory::CircuitOpen,
                    (*retry_after_ms).max(1),
                    format!("circuit for {dependency} is open"),
                );
            }
            _ => {}
        }

        if let IntegrationError::Http { status, .. } = error {
            if (400..500).contains(status) && *status != 429 {
                return RetryDecision::deny(
                    RetryCategory::PermanentRejection,
                    format!("http {status} rejects the request"),
                );
            }
        }
        let message = error.message().to_ascii_lowercase();
        if let Some(pattern) = PERMANENT_PATTERNS.iter().find(|p| message.contains(**p)) {
            return RetryDecision::deny(
                RetryCategory::PermanentRejection,
                format!("message indicates {pattern}"),
            );
        }

        match error {
            IntegrationError::Http { status: 429, .. } => {
                return RetryDecision::retry(
                    RetryCategory::RateLimited,
                    delays.rate_limit_ms,
                    "rate limited by provider",
                );
            }
            IntegrationError::Http { status, .. } if *status >= 500 => {
                let delay = if payment {
                    delays.payment_server_fault_ms
                } else {
                    delays.server_fault_ms
                };
                return RetryDecision::retry(
                    RetryCategory::ServerFault,
                    delay,
                    format!("provider returned {status}"),
                );
            }
            IntegrationError::Persistence { code, .. } => match code {
                PersistenceCode::RecordNotFound => {
                    let delay = if payment {
                        delays.race_condition_ms / 2
                    } else {
                        delays.race_condition_ms
                    };
                    return RetryDecision::retry(
                        RetryCategory::RaceCondition,
                        delay,
                        "record not yet visible",
                    );
                }
                PersistenceCode::ConnectionClosed | PersistenceCode::PoolExhausted => {
                    return RetryDecision::retry(
                        RetryCategory::Connection,
                        delays.connection_ms,
                        format!("database {code}"),
                    );
                }
                PersistenceCode::ConnectionTimeout => {
                    return RetryDecision::retry(
                        RetryCategory::Timeout,
                        delays.timeout_ms,
                        "database connection timed out",
                    );
                }
                PersistenceCode::UniqueViolation | PersistenceCode::ForeignKeyViolation => {
                    return RetryDecision::deny(
                        RetryCategory::Constraint,
                        format!("database {code}"),
                    );
                }
                PersistenceCode::Unknown => {}
            },
            IntegrationError::Timeout(_) => {
                return RetryDecision::retry(
                    RetryCategory::Timeout,
                    delays.timeout_ms,
                    "call timed out",
                );
            }
            IntegrationError::Connection(_) => {
                return RetryDecision::retry(
                    RetryCategory::Connection,
                    delays.connection_ms,
                    "connection failed",
                );
            }
            IntegrationError::Validation(_) => {
                return RetryDecision::deny(RetryCategory::Validation, "input failed validation");
            }
            _ => {}
        }

        if let Some(pattern) = TRANSIENT_PATTERNS.iter().find(|p| message.contains(**p)) {
            let (category, delay) = if pattern.contains("time") {
                (RetryCategory::Timeout, delays.timeout_ms)
            } else {
                (RetryCategory::Connection, delays.connection_ms)
            };
            return RetryDecision::retry(category, delay, format!("message indicates {pattern}"));
        }

        RetryDecision::deny(RetryCategory::Unknown, "unrecognised failure")
    }
}
