pub mod admission;
pub mod breaker;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod idempotency;
pub mod retry;
pub mod signature;

pub use admission::{
    AdmissionErrorKind, AdmissionPolicy, AdmittedEvent, Clock, FixtureEventPolicy, Rejection,
    StaleEventPolicy, StrictFreshness, ValidationResult,
};
pub use breaker::{
    BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig, FailurePredicate,
    StateObserver,
};
pub use envelope::{EnvelopeError, EventData, WebhookEnvelope, WebhookHeaders};
pub use environment::{EnvironmentDetector, HeuristicEnvironmentDetector, WebhookEnvironment};
pub use error::{ErrorClass, IntegrationError, PersistenceCode};
pub use idempotency::{Disposition, IdempotencyRecord, IdempotencyStatus, IdempotentExecutor};
pub use retry::{RetryCategory, RetryClassifier, RetryDecision, RetryDelays};
pub use signature::{SignatureAlgorithm, SigningSecrets};
