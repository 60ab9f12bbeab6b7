use std::{fmt, sync::Arc, time::Instant};

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::envelope::{EnvelopeError, WebhookEnvelope, WebhookHeaders};
use crate::environment::{EnvironmentDetector, HeuristicEnvironmentDetector, WebhookEnvironment};
use crate::signature::{self, SignatureAlgorithm, SigningSecrets};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Reasons a webhook is refused. All of them are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionErrorKind {
    PayloadTooLarge,
    MissingSignature,
    MalformedBody,
    InvalidPayload,
    MissingSecret,
    InvalidSignature,
    EventTooOld,
}

impl AdmissionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PayloadTooLarge => "payload_too_large",
            Self::MissingSignature => "missing_signature",
            Self::MalformedBody => "malformed_body",
            Self::InvalidPayload => "invalid_payload",
            Self::MissingSecret => "missing_secret",
            Self::InvalidSignature => "invalid_signature",
            Self::EventTooOld => "event_too_old",
        }
    }
}

impl fmt::Display for AdmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A webhook that passed every admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedEvent {
    pub environment: WebhookEnvironment,
    pub algorithm: SignatureAlgorithm,
    /// Correlation id for logs. Never used for deduplication.
    pub webhook_id: String,
    pub processing_time_ms: f64,
    pub received_at: DateTime<Utc>,
    /// Set when an aged production event was admitted as provider test traffic.
    pub stale_test_event: bool,
    pub envelope: WebhookEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: AdmissionErrorKind,
    pub details: String,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid(Box<AdmittedEvent>),
    Invalid(Rejection),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Decides whether an aged production event is known provider test traffic.
pub trait StaleEventPolicy: Send + Sync {
    fn is_stale_test_event(&self, envelope: &WebhookEnvelope, age: Duration) -> bool;
}

/// Fingerprint of the fixture events Square occasionally replays to
/// production endpoints: over a year old, created in one of the fixture
/// years, and carrying a test marker in the event, object or merchant id.
#[derive(Debug, Clone)]
pub struct FixtureEventPolicy {
    pub min_age: Duration,
    pub fixture_years: Vec<i32>,
    pub id_markers: Vec<String>,
}

impl Default for FixtureEventPolicy {
    fn default() -> Self {
        Self {
            min_age: Duration::days(365),
            fixture_years: vec![2019, 2020, 2021],
            id_markers: ["test", "fixture", "sample"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl StaleEventPolicy for FixtureEventPolicy {
    fn is_stale_test_event(&self, envelope: &WebhookEnvelope, age: Duration) -> bool {
        if age <= self.min_age {
            return false;
        }
        if !self.fixture_years.contains(&envelope.created_at.year()) {
            return false;
        }
        let ids = [
            envelope.event_id.to_ascii_lowercase(),
            envelope.data.id.to_ascii_lowercase(),
            envelope.merchant_id.to_ascii_lowercase(),
        ];
        self.id_markers
            .iter()
            .any(|marker| ids.iter().any(|id| id.contains(marker.as_str())))
    }
}

/// Policy that never exempts aged events.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictFreshness;

impl StaleEventPolicy for StrictFreshness {
    fn is_stale_test_event(&self, _envelope: &WebhookEnvelope, _age: Duration) -> bool {
        false
    }
}

/// Admission of inbound webhooks: a pure decision over the request headers,
/// the raw body, the notification URL and the injected clock. Duplicate
/// `event_id`s are the ledger's concern.
#[derive(Clone)]
pub struct AdmissionPolicy {
    secrets: SigningSecrets,
    detector: Arc<dyn EnvironmentDetector>,
    stale_policy: Arc<dyn StaleEventPolicy>,
    max_event_age: Duration,
    max_body_bytes: usize,
    clock: Clock,
}

impl AdmissionPolicy {
    pub fn new(
        secrets: SigningSecrets,
        max_event_age: std::time::Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            secrets,
            detector: Arc::new(HeuristicEnvironmentDetector::default()),
            stale_policy: Arc::new(FixtureEventPolicy::default()),
            max_event_age: Duration::from_std(max_event_age).unwrap_or(Duration::minutes(5)),
            max_body_bytes,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn EnvironmentDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_stale_policy(mut self, policy: Arc<dyn StaleEventPolicy>) -> Self {
        self.stale_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Runs the admission checks in order: size, signature headers, body
    /// shape, signature, freshness.
    pub fn admit(
        &self,
        headers: &WebhookHeaders,
        raw_body: &[u8],
        notification_url: &str,
    ) -> ValidationResult {
        let start = Instant::now();
        match self.evaluate(headers, raw_body, notification_url, start) {
            Ok(admitted) => {
                info!(
                    stage = "admission",
                    event_id = %admitted.envelope.event_id,
                    event_type = %admitted.envelope.event_type,
                    webhook_id = %admitted.webhook_id,
                    environment = admitted.environment.as_str(),
                    algorithm = admitted.algorithm.as_str(),
                    "webhook admitted"
                );
                ValidationResult::Valid(Box::new(admitted))
            }
            Err(rejection) => {
                warn!(
                    stage = "admission",
                    kind = rejection.kind.as_str(),
                    event_id = rejection.event_id.as_deref().unwrap_or("-"),
                    event_type = rejection.event_type.as_deref().unwrap_or("-"),
                    details = %rejection.details,
                    "webhook rejected"
                );
                ValidationResult::Invalid(rejection)
            }
        }
    }

    fn evaluate(
        &self,
        headers: &WebhookHeaders,
        raw_body: &[u8],
        notification_url: &str,
        start: Instant,
    ) -> Result<AdmittedEvent, Rejection> {
        if raw_body.len() > self.max_body_bytes {
            return Err(reject(
                AdmissionErrorKind::PayloadTooLarge,
                format!(
                    "body of {} bytes exceeds limit of {} bytes",
                    raw_body.len(),
                    self.max_body_bytes
                ),
                None,
            ));
        }

        let Some((algorithm, provided)) = signature::select_signature(headers) else {
            return Err(reject(
                AdmissionErrorKind::MissingSignature,
                "no Square signature header present",
                None,
            ));
        };

        let envelope = WebhookEnvelope::parse(raw_body).map_err(|err| match err {
            EnvelopeError::Malformed(detail) => {
                reject(AdmissionErrorKind::MalformedBody, detail, None)
            }
            EnvelopeError::Schema(detail) => {
                reject(AdmissionErrorKind::InvalidPayload, detail, None)
            }
        })?;

        let environment = self.detector.detect(headers);
        let Some(secret) = self.secrets.secret_for(environment) else {
            return Err(reject(
                AdmissionErrorKind::MissingSecret,
                format!("no signature key configured for {}", environment.as_str()),
                Some(&envelope),
            ));
        };

        if !signature::verify(notification_url, raw_body, provided, &secret, algorithm) {
            return Err(reject(
                AdmissionErrorKind::InvalidSignature,
                format!("{} signature mismatch", algorithm.as_str()),
                Some(&envelope),
            ));
        }

        let received_at = (self.clock)();
        let stale_test_event = self.check_age(&envelope, environment, received_at)?;

        Ok(AdmittedEvent {
            environment,
            algorithm,
            webhook_id: derive_webhook_id(&envelope.event_id, received_at),
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            received_at,
            stale_test_event,
            envelope,
        })
    }

    /// Returns `Ok(true)` when an aged event was admitted as test traffic.
    fn check_age(
        &self,
        envelope: &WebhookEnvelope,
        environment: WebhookEnvironment,
        now: DateTime<Utc>,
    ) -> Result<bool, Rejection> {
        // Sandbox replays historical fixtures indefinitely.
        if environment == WebhookEnvironment::Sandbox {
            return Ok(false);
        }

        let age = now.signed_duration_since(envelope.created_at);
        if age < -self.max_event_age {
            return Err(reject(
                AdmissionErrorKind::EventTooOld,
                format!(
                    "created_at {} is {}s in the future",
                    envelope.created_at.to_rfc3339(),
                    -age.num_seconds()
                ),
                Some(envelope),
            ));
        }
        if age <= self.max_event_age {
            return Ok(false);
        }

        if self.stale_policy.is_stale_test_event(envelope, age) {
            warn!(
                stage = "admission",
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                created_at = %envelope.created_at.to_rfc3339(),
                age_days = age.num_days(),
                "admitting stale provider test event"
            );
            return Ok(true);
        }

        Err(reject(
            AdmissionErrorKind::EventTooOld,
            format!(
                "event age {}s exceeds {}s",
                age.num_seconds(),
                self.max_event_age.num_seconds()
            ),
            Some(envelope),
        ))
    }
}

fn reject(
    kind: AdmissionErrorKind,
    details: impl Into<String>,
    envelope: Option<&WebhookEnvelope>,
) -> Rejection {
    Rejection {
        kind,
        details: details.into(),
        event_id: envelope.map(|e| e.event_id.clone()),
        event_type: envelope.map(|e| e.event_type.clone()),
    }
}

/// Deterministic correlation id derived from the event id and receipt time.
pub fn derive_webhook_id(event_id: &str, received_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    hasher.update(
        received_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .as_bytes(),
    );
    let digest = hex::encode(hasher.finalize());
    format!("wh_{}", &digest[..16])
}
