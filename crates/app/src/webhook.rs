use std::{borrow::Cow, time::Instant};

use axum::{
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use sqgate_core::{
    signature::reconstruct_notification_url, AdmissionErrorKind, AdmittedEvent, Rejection,
    ValidationResult, WebhookHeaders,
};
use sqgate_storage::{EventLedgerError, LedgerInsertOutcome, NewWebhookEvent};
use tracing::{error, info, warn};

use crate::dispatch::DispatchOutcome;
use crate::problem::ProblemResponse;
use crate::router::AppState;

pub async fn handle(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = process(&state, &uri, &headers, &body).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    histogram!("webhook_ack_latency_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
    result
}

async fn process(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProblemResponse> {
    let webhook_headers = WebhookHeaders::from_pairs(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value))),
    );
    let notification_url = notification_url(state, uri, headers);

    let admitted = match state
        .admission()
        .admit(&webhook_headers, body, &notification_url)
    {
        ValidationResult::Valid(admitted) => admitted,
        ValidationResult::Invalid(rejection) => {
            counter!("webhook_admission_total", "result" => rejection.kind.as_str()).increment(1);
            return Err(rejection_problem(&rejection));
        }
    };
    counter!("webhook_admission_total", "result" => "admitted").increment(1);

    if admitted.stale_test_event {
        info!(
            stage = "ingress",
            event_id = %admitted.envelope.event_id,
            "acknowledging stale fixture event without processing"
        );
        return Ok(status_response(StatusCode::OK, "ignored", &admitted));
    }

    if !claim(state, &admitted, body).await? {
        counter!("webhook_duplicate_total").increment(1);
        info!(
            stage = "ingress",
            event_id = %admitted.envelope.event_id,
            webhook_id = %admitted.webhook_id,
            "duplicate delivery acknowledged"
        );
        return Ok(status_response(StatusCode::OK, "duplicate", &admitted));
    }

    let outcome = state
        .dispatcher()
        .dispatch(&admitted)
        .await
        .map_err(|err| {
            error!(
                stage = "ingress",
                event_id = %admitted.envelope.event_id,
                error = %err,
                "failed to record processing outcome"
            );
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "failed to record webhook processing",
            )
        })?;

    let response = match outcome {
        DispatchOutcome::Processed { .. } => {
            status_response(StatusCode::OK, "processed", &admitted)
        }
        // Acknowledged so the provider stops redelivering; kept in the ledger.
        DispatchOutcome::Rejected { .. } => status_response(StatusCode::OK, "failed", &admitted),
        DispatchOutcome::Deferred { decision, .. } => ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "processing_deferred",
            format!("event will be retried: {}", decision.reason),
        )
        .with_retry_after_ms(decision.delay_ms)
        .into_response(),
    };
    Ok(response)
}

/// Inserts the event into the ledger, or re-claims a redelivery of a
/// deferred or abandoned event. Returns `false` for true duplicates.
async fn claim(
    state: &AppState,
    admitted: &AdmittedEvent,
    body: &[u8],
) -> Result<bool, ProblemResponse> {
    let ledger = state.storage().event_ledger();
    let storage_error = |err: EventLedgerError| {
        error!(stage = "storage", error = %err, "ledger write failed");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            "failed to persist webhook",
        )
    };

    let envelope = &admitted.envelope;
    let outcome = ledger
        .insert(NewWebhookEvent {
            event_id: Cow::Borrowed(&envelope.event_id),
            webhook_id: Cow::Borrowed(&admitted.webhook_id),
            event_type: Cow::Borrowed(&envelope.event_type),
            merchant_id: Cow::Borrowed(&envelope.merchant_id),
            environment: admitted.environment.as_str(),
            payload_json: String::from_utf8_lossy(body),
            created_at: envelope.created_at,
            received_at: admitted.received_at,
        })
        .await
        .map_err(storage_error)?;

    match outcome {
        LedgerInsertOutcome::Inserted => Ok(true),
        LedgerInsertOutcome::Duplicate => {
            let now = state.now();
            ledger
                .claim(&envelope.event_id, now, now - state.claim_lease())
                .await
                .map_err(storage_error)
        }
    }
}

/// The URL Square signed: the configured value, otherwise rebuilt from the
/// forwarded scheme and host of this request.
fn notification_url(state: &AppState, uri: &axum::http::Uri, headers: &HeaderMap) -> String {
    if let Some(configured) = state.notification_url() {
        return configured.to_string();
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(',').next().unwrap_or_default().trim())
            .filter(|value| !value.is_empty())
    };
    let scheme = header("x-forwarded-proto").unwrap_or("https");
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .unwrap_or("localhost");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    reconstruct_notification_url(scheme, host, path)
}

fn rejection_problem(rejection: &Rejection) -> ProblemResponse {
    let status = match rejection.kind {
        AdmissionErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        AdmissionErrorKind::MissingSignature | AdmissionErrorKind::InvalidSignature => {
            StatusCode::UNAUTHORIZED
        }
        AdmissionErrorKind::MalformedBody
        | AdmissionErrorKind::InvalidPayload
        | AdmissionErrorKind::EventTooOld => StatusCode::BAD_REQUEST,
        AdmissionErrorKind::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(
            stage = "ingress",
            kind = rejection.kind.as_str(),
            "no signing key configured for webhook environment"
        );
    }
    ProblemResponse::new(status, rejection.kind.as_str(), rejection.details.clone())
}

fn status_response(status: StatusCode, label: &str, admitted: &AdmittedEvent) -> Response {
    (
        status,
        Json(json!({
            "status": label,
            "event_id": admitted.envelope.event_id,
            "webhook_id": admitted.webhook_id,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use sqgate_core::{
        signature::compute_signature, IntegrationError, SignatureAlgorithm, WebhookEnvironment,
    };
    use sqgate_storage::EventStatus;
    use sqgate_util::IntegrationConfig;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::dispatch::{EventHandler, HandlerFuture};
    use crate::router::{
        app_router,
        tests::{setup_state, test_config},
    };

    const FIXED_NOW: &str = "2024-06-01T12:00:00Z";
    const NOTIFICATION_URL: &str = "https://shop.example.com/webhooks/square";

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(FIXED_NOW)
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct FlakyHandler {
        calls: AtomicUsize,
        failures: usize,
        error: IntegrationError,
    }

    impl EventHandler for FlakyHandler {
        fn handle<'a>(&'a self, _event: &'a AdmittedEvent) -> HandlerFuture<'a> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            };
            Box::pin(async move { result })
        }
    }

    async fn setup(config: IntegrationConfig) -> (AppState, TempDir) {
        let (state, dir) = setup_state(&config).await;
        let now = fixed_now();
        (state.with_clock(Arc::new(move || now)), dir)
    }

    fn config() -> IntegrationConfig {
        test_config("http://127.0.0.1:9/")
    }

    fn body(event_id: &str, created_at: &str) -> String {
        json!({
            "merchant_id": "MLEFBHHSJGVHD",
            "type": "payment.updated",
            "event_id": event_id,
            "created_at": created_at,
            "data": {
                "type": "payment",
                "id": "KkAkhdMsgzn59SM8A89WgKwekxLZY",
                "object": {"payment": {"status": "COMPLETED"}}
            }
        })
        .to_string()
    }

    fn signed_request(body: &str, key: &str, extra: &[(&str, &str)]) -> Request<Body> {
        let signature = compute_signature(
            SignatureAlgorithm::HmacSha256,
            NOTIFICATION_URL,
            body.as_bytes(),
            key,
        )
        .expect("signature");
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/square")
            .header("host", "shop.example.com")
            .header("content-type", "application/json")
            .header("x-square-hmacsha256-signature", signature);
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn read_json(response: Response) -> Value {
        let collected = response.into_body().collect().await.expect("body");
        serde_json::from_slice(&collected.to_bytes()).expect("json")
    }

    #[tokio::test]
    async fn valid_delivery_is_processed_and_recorded() {
        let (state, _dir) = setup(config()).await;
        let ledger = state.storage().event_ledger();
        let payload = body("evt-100", "2024-06-01T11:59:00Z");

        let response = app_router(state)
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["status"], "processed");
        assert_eq!(json["event_id"], "evt-100");

        let stored = ledger.fetch("evt-100").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Processed);
        assert_eq!(stored.environment, WebhookEnvironment::Production.as_str());
        assert_eq!(stored.payload["data"]["type"], "payment");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_once() {
        let (state, _dir) = setup(config()).await;
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures: 0,
            error: IntegrationError::Other("unused".into()),
        });
        let app = app_router(state.with_event_handler(handler.clone()));
        let payload = body("evt-dup", "2024-06-01T11:59:00Z");

        let first = app
            .clone()
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("first");
        assert_eq!(read_json(first).await["status"], "processed");

        let second = app
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("second");
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(read_json(second).await["status"], "duplicate");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized() {
        let (state, _dir) = setup(config()).await;
        let payload = body("evt-101", "2024-06-01T11:59:00Z");

        let response = app_router(state)
            .oneshot(signed_request(&payload, "wrong-key", &[]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["type"], "invalid_signature");
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized() {
        let (state, _dir) = setup(config()).await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/square")
            .header("host", "shop.example.com")
            .body(Body::from(body("evt-102", "2024-06-01T11:59:00Z")))
            .expect("request");

        let response = app_router(state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["type"], "missing_signature");
    }

    #[tokio::test]
    async fn old_production_event_is_rejected() {
        let (state, _dir) = setup(config()).await;
        let payload = body("evt-103", "2024-06-01T11:00:00Z");

        let response = app_router(state)
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["type"], "event_too_old");
    }

    #[tokio::test]
    async fn sandbox_event_uses_sandbox_key_and_skips_age_check() {
        let (state, _dir) = setup(config()).await;
        let payload = body("evt-104", "2024-05-01T00:00:00Z");

        let response = app_router(state)
            .oneshot(signed_request(
                &payload,
                "sandbox-key",
                &[("square-environment", "Sandbox")],
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["status"], "processed");
    }

    #[tokio::test]
    async fn oversize_body_is_rejected_before_verification() {
        let mut config = config();
        config.max_body_bytes = 64;
        let (state, _dir) = setup(config).await;
        let payload = body("evt-105", "2024-06-01T11:59:00Z");

        let response = app_router(state)
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn notification_url_is_rebuilt_from_forwarded_headers() {
        let mut config = config();
        config.notification_url = None;
        let (state, _dir) = setup(config).await;
        let payload = body("evt-106", "2024-06-01T11:59:00Z");

        let request = signed_request(
            &payload,
            "prod-key",
            &[("x-forwarded-proto", "https"), ("x-forwarded-host", "shop.example.com")],
        );
        let response = app_router(state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn long_transient_delay_defers_and_redelivery_resumes() {
        let (state, _dir) = setup(config()).await;
        let ledger = state.storage().event_ledger();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures: 1,
            error: IntegrationError::Timeout("inventory lookup".into()),
        });
        let app = app_router(state.with_event_handler(handler.clone()));
        let payload = body("evt-107", "2024-06-01T11:59:00Z");

        let first = app
            .clone()
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("first");
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            first.headers().get("retry-after").and_then(|v| v.to_str().ok()),
            Some("5")
        );
        let stored = ledger.fetch("evt-107").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Deferred);

        let second = app
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("second");
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(read_json(second).await["status"], "processed");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.attempts("evt-107").await.expect("attempts").len(), 2);
    }

    #[tokio::test]
    async fn open_dependency_circuit_answers_retry_after_cooldown() {
        let (state, _dir) = setup(config()).await;
        let ledger = state.storage().event_ledger();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures: 1,
            error: IntegrationError::CircuitOpen {
                dependency: "square_payments".into(),
                retry_after_ms: 28_000,
            },
        });
        let app = app_router(state.with_event_handler(handler.clone()));
        let payload = body("evt-109", "2024-06-01T11:59:00Z");

        let response = app
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
            Some("28")
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(ledger.attempts("evt-109").await.expect("attempts").is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_acknowledged_and_kept() {
        let (state, _dir) = setup(config()).await;
        let ledger = state.storage().event_ledger();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures: 1,
            error: IntegrationError::Validation("unknown location".into()),
        });
        let app = app_router(state.with_event_handler(handler.clone()));
        let payload = body("evt-108", "2024-06-01T11:59:00Z");

        let response = app
            .oneshot(signed_request(&payload, "prod-key", &[]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["status"], "failed");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stored = ledger.fetch("evt-108").await.expect("fetch").expect("row");
        assert_eq!(stored.status, EventStatus::Failed);
    }
}
