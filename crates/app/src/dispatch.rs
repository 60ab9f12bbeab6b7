use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use metrics::counter;
use sqgate_core::{
    AdmittedEvent, Clock, IntegrationError, RetryCategory, RetryClassifier, RetryDecision,
};
use sqgate_storage::{AttemptOutcome, EventLedger, EventStatus, NewAttempt};
use tracing::{info, warn};

/// Longest delay a single delivery waits in-request before the next attempt.
/// Longer delays defer the event to provider redelivery.
pub const DEFAULT_MAX_INLINE_DELAY: Duration = Duration::from_secs(2);

pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), IntegrationError>> + Send + 'a>>;

/// Business logic run for every admitted webhook.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(&'a self, event: &'a AdmittedEvent) -> HandlerFuture<'a>;
}

/// Default handler: logs the event and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle<'a>(&'a self, event: &'a AdmittedEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                stage = "app",
                event_id = %event.envelope.event_id,
                event_type = %event.envelope.event_type,
                object_type = %event.envelope.data.object_type,
                object_id = %event.envelope.data.id,
                merchant_id = %event.envelope.merchant_id,
                "webhook event received"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed { attempts: u32 },
    /// Failed with a non-retryable error; kept in the ledger for manual replay.
    Rejected { attempts: u32, decision: RetryDecision },
    /// Retryable failure left to provider redelivery: attempts exhausted, the
    /// delay is longer than the in-request cap, or a dependency's circuit is
    /// open. A short-circuited call is not counted in `attempts`.
    Deferred { attempts: u32, decision: RetryDecision },
}

/// Runs the handler with bounded, classified retries and records every
/// attempt in the ledger.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    classifier: RetryClassifier,
    ledger: EventLedger,
    max_attempts: u32,
    max_inline_delay: Duration,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        classifier: RetryClassifier,
        ledger: EventLedger,
        max_attempts: u32,
        clock: Clock,
    ) -> Self {
        Self {
            handler,
            classifier,
            ledger,
            max_attempts: max_attempts.max(1),
            max_inline_delay: DEFAULT_MAX_INLINE_DELAY,
            clock,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_inline_delay(mut self, delay: Duration) -> Self {
        self.max_inline_delay = delay;
        self
    }

    /// Processes `event`, which must already be claimed in the ledger.
    ///
    /// Errors are ledger failures; handler failures are reported through
    /// [`DispatchOutcome`].
    pub async fn dispatch(
        &self,
        event: &AdmittedEvent,
    ) -> Result<DispatchOutcome, IntegrationError> {
        let event_id = event.envelope.event_id.as_str();
        let event_type = event.envelope.event_type.as_str();
        let first_attempt = self.ledger.attempt_count(event_id).await? + 1;
        let last_attempt = first_attempt + self.max_attempts - 1;
        let mut attempt = first_attempt;

        loop {
            let result = self.handler.handle(event).await;
            let attempted_at = (self.clock)();
            let attempts = attempt - first_attempt + 1;

            let err = match result {
                Ok(()) => {
                    self.ledger
                        .record_attempt(NewAttempt {
                            event_id,
                            attempt,
                            outcome: AttemptOutcome::Succeeded,
                            error: None,
                            decision: None,
                            attempted_at,
                        })
                        .await?;
                    self.ledger.mark_processed(event_id, attempted_at).await?;
                    return Ok(DispatchOutcome::Processed { attempts });
                }
                Err(err) => err,
            };

            let decision = self.classifier.classify(Some(&err), event_type);
            let retry_label = if decision.should_retry { "true" } else { "false" };
            counter!("retry_decisions_total", "retry" => retry_label).increment(1);

            if decision.category == RetryCategory::CircuitOpen {
                warn!(
                    stage = "retry",
                    event_id,
                    event_type,
                    error = %err,
                    delay_ms = decision.delay_ms,
                    "dependency circuit open; deferring to provider redelivery"
                );
                self.ledger
                    .mark(event_id, EventStatus::Deferred, attempted_at)
                    .await?;
                return Ok(DispatchOutcome::Deferred {
                    attempts: attempts - 1,
                    decision,
                });
            }

            let message = err.to_string();
            self.ledger
                .record_attempt(NewAttempt {
                    event_id,
                    attempt,
                    outcome: AttemptOutcome::Failed,
                    error: Some(&message),
                    decision: Some(&decision),
                    attempted_at,
                })
                .await?;

            if !decision.should_retry {
                warn!(
                    stage = "retry",
                    event_id,
                    event_type,
                    attempt,
                    error = %err,
                    reason = %decision.reason,
                    "permanent failure; event kept for manual replay"
                );
                self.ledger
                    .mark(event_id, EventStatus::Failed, attempted_at)
                    .await?;
                return Ok(DispatchOutcome::Rejected { attempts, decision });
            }

            let delay = Duration::from_millis(decision.delay_ms);
            if attempt >= last_attempt || delay > self.max_inline_delay {
                warn!(
                    stage = "retry",
                    event_id,
                    event_type,
                    attempt,
                    error = %err,
                    delay_ms = decision.delay_ms,
                    exhausted = attempt >= last_attempt,
                    "deferring to provider redelivery"
                );
                self.ledger
                    .mark(event_id, EventStatus::Deferred, attempted_at)
                    .await?;
                return Ok(DispatchOutcome::Deferred { attempts, decision });
            }

            info!(
                stage = "retry",
                event_id,
                event_type,
                attempt,
                delay_ms = decision.delay_ms,
                category = decision.category.as_str(),
                "retrying event"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use support::ScriptedHandler;
    use serde_json::json;
    use sqgate_core::{
        envelope::WebhookEnvelope, PersistenceCode, RetryDelays, SignatureAlgorithm,
        WebhookEnvironment,
    };
    use sqgate_storage::{Database, LedgerInsertOutcome, NewWebhookEvent};
    use std::borrow::Cow;
    use tempfile::TempDir;

    mod support {
        use super::*;
        use std::sync::Mutex;

        /// Handler returning a scripted sequence of results.
        pub struct ScriptedHandler {
            script: Mutex<Vec<Result<(), IntegrationError>>>,
            pub calls: Mutex<u32>,
        }

        impl ScriptedHandler {
            pub fn new(mut script: Vec<Result<(), IntegrationError>>) -> Self {
                script.reverse();
                Self {
                    script: Mutex::new(script),
                    calls: Mutex::new(0),
                }
            }

            pub fn calls(&self) -> u32 {
                *self.calls.lock().expect("calls lock")
            }
        }

        impl EventHandler for ScriptedHandler {
            fn handle<'a>(&'a self, _event: &'a AdmittedEvent) -> HandlerFuture<'a> {
                *self.calls.lock().expect("calls lock") += 1;
                let next = self.script.lock().expect("script lock").pop().unwrap_or(Ok(()));
                Box::pin(async move { next })
            }
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .expect("time")
            .with_timezone(&Utc)
    }

    fn admitted(event_id: &str, event_type: &str) -> AdmittedEvent {
        let raw = json!({
            "merchant_id": "M1",
            "type": event_type,
            "event_id": event_id,
            "created_at": "2024-06-01T11:59:00Z",
            "data": {"type": "payment", "id": "pay-1", "object": {}}
        })
        .to_string();
        AdmittedEvent {
            environment: WebhookEnvironment::Production,
            algorithm: SignatureAlgorithm::HmacSha256,
            webhook_id: "wh_test".into(),
            processing_time_ms: 0.1,
            received_at: now(),
            stale_test_event: false,
            envelope: WebhookEnvelope::parse(raw.as_bytes()).expect("envelope"),
        }
    }

    async fn setup(event: &AdmittedEvent) -> (EventLedger, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("dispatch.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        let ledger = db.event_ledger();
        let outcome = ledger
            .insert(NewWebhookEvent {
                event_id: Cow::Borrowed(&event.envelope.event_id),
                webhook_id: Cow::Borrowed(&event.webhook_id),
                event_type: Cow::Borrowed(&event.envelope.event_type),
                merchant_id: Cow::Borrowed(&event.envelope.merchant_id),
                environment: event.environment.as_str(),
                payload_json: Cow::Borrowed("{}"),
                created_at: event.envelope.created_at,
                received_at: event.received_at,
            })
            .await
            .expect("insert");
        assert_eq!(outcome, LedgerInsertOutcome::Inserted);
        (ledger, dir)
    }

    /// Short delays for the categories that retry in-request; timeouts keep
    /// the default 5s, past the one second cap.
    fn dispatcher(ledger: EventLedger, handler: Arc<dyn EventHandler>) -> Dispatcher {
        let fixed = now();
        let delays = RetryDelays {
            payment_server_fault_ms: 15,
            race_condition_ms: 20,
            ..RetryDelays::default()
        };
        Dispatcher::new(
            handler,
            RetryClassifier::new(delays),
            ledger,
            3,
            Arc::new(move || fixed),
        )
        .with_max_inline_delay(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_processed() {
        let event = admitted("evt-d1", "payment.updated");
        let (ledger, _dir) = setup(&event).await;
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(IntegrationError::http(503, "unavailable")),
            Ok(()),
        ]));

        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        assert_eq!(outcome, DispatchOutcome::Processed { attempts: 2 });
        assert_eq!(handler.calls(), 2);

        let attempts = ledger.attempts("evt-d1").await.expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].retry_delay_ms, Some(15));
        let stored = ledger.fetch("evt-d1").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Processed);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let event = admitted("evt-d2", "payment.updated");
        let (ledger, _dir) = setup(&event).await;
        let handler = Arc::new(ScriptedHandler::new(vec![Err(IntegrationError::Http {
            status: 403,
            code: Some("FORBIDDEN".into()),
            message: "merchant mismatch".into(),
        })]));

        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Rejected { attempts: 1, .. }));
        assert_eq!(handler.calls(), 1);
        let stored = ledger.fetch("evt-d2").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn exhausted_retries_defer_and_continue_numbering() {
        let event = admitted("evt-d3", "inventory.count.updated");
        let (ledger, _dir) = setup(&event).await;
        let race = || IntegrationError::Persistence {
            code: PersistenceCode::RecordNotFound,
            message: "order not visible yet".into(),
        };
        let handler = Arc::new(ScriptedHandler::new(vec![Err(race()), Err(race()), Err(race())]));

        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        match outcome {
            DispatchOutcome::Deferred { attempts, decision } => {
                assert_eq!(attempts, 3);
                assert_eq!(decision.delay_ms, 20);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let stored = ledger.fetch("evt-d3").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Deferred);

        // Redelivery picks up where the previous delivery stopped.
        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        assert_eq!(outcome, DispatchOutcome::Processed { attempts: 1 });
        let attempts = ledger.attempts("evt-d3").await.expect("attempts");
        assert_eq!(attempts.last().map(|a| a.attempt), Some(4));
    }

    #[tokio::test]
    async fn open_circuit_defers_without_calling_again() {
        let event = admitted("evt-d5", "payment.updated");
        let (ledger, _dir) = setup(&event).await;
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(IntegrationError::CircuitOpen {
                dependency: "square_payments".into(),
                retry_after_ms: 28_000,
            }),
            Ok(()),
        ]));

        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        match outcome {
            DispatchOutcome::Deferred { attempts, decision } => {
                assert_eq!(attempts, 0);
                assert_eq!(decision.category, RetryCategory::CircuitOpen);
                assert_eq!(decision.delay_ms, 28_000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(handler.calls(), 1);
        assert!(ledger.attempts("evt-d5").await.expect("attempts").is_empty());
        let stored = ledger.fetch("evt-d5").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Deferred);

        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        assert_eq!(outcome, DispatchOutcome::Processed { attempts: 1 });
        let attempts = ledger.attempts("evt-d5").await.expect("attempts");
        assert_eq!(attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn delay_beyond_inline_cap_defers_immediately() {
        let event = admitted("evt-d6", "order.updated");
        let (ledger, _dir) = setup(&event).await;
        let handler = Arc::new(ScriptedHandler::new(vec![Err(IntegrationError::Timeout(
            "inventory lookup".into(),
        ))]));

        let started = std::time::Instant::now();
        let outcome = dispatcher(ledger.clone(), handler.clone())
            .dispatch(&event)
            .await
            .expect("dispatch");
        assert!(started.elapsed() < Duration::from_secs(1));
        match outcome {
            DispatchOutcome::Deferred { attempts, decision } => {
                assert_eq!(attempts, 1);
                assert_eq!(decision.delay_ms, 5_000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(handler.calls(), 1);
        let attempts = ledger.attempts("evt-d6").await.expect("attempts");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].retry_delay_ms, Some(5_000));
    }

    #[tokio::test]
    async fn logging_handler_succeeds() {
        let event = admitted("evt-d4", "order.created");
        assert!(LoggingEventHandler.handle(&event).await.is_ok());
    }
}
