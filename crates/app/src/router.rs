use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use sqgate_core::{
    AdmissionPolicy, BreakerSnapshot, CircuitBreakerConfig, Clock, IdempotentExecutor,
    RetryClassifier, SigningSecrets,
};
use sqgate_square::{
    CreatePaymentRequest, Payment, PaymentsClient, ShippingClient, ShippingQuote,
    ShippingRateRequest,
};
use sqgate_storage::Database;
use sqgate_util::IntegrationConfig;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::dispatch::{Dispatcher, EventHandler, LoggingEventHandler};
use crate::outbound::{
    instrumented_breaker, PaymentGateway, ShippingGateway, PAYMENTS_DEPENDENCY,
    SHIPPING_DEPENDENCY,
};
use crate::problem::ProblemResponse;
use crate::{telemetry, webhook};

/// Slack between the breaker's own call timeout and the idempotency
/// executor's, so the breaker observes and counts the timeout first.
const EXECUTOR_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    admission: AdmissionPolicy,
    dispatcher: Dispatcher,
    payments: PaymentGateway,
    shipping: ShippingGateway,
    payment_executor: Arc<IdempotentExecutor<Payment>>,
    notification_url: Option<String>,
    max_body_bytes: usize,
    claim_lease: chrono::Duration,
    api_auth_token: Option<Arc<str>>,
    clock: Clock,
}

#[derive(Debug, Error)]
pub enum AppStateError {
    #[error("invalid {name} base url: {source}")]
    BaseUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        config: &IntegrationConfig,
    ) -> Result<Self, AppStateError> {
        let clock: Clock = Arc::new(Utc::now);
        let http = reqwest::Client::builder()
            .timeout(config.outbound_timeout)
            .build()?;

        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.breaker_failure_threshold,
            cooldown: config.breaker_cooldown,
            call_timeout: Some(config.outbound_timeout),
        };

        let payments_base = parse_base_url("payments", &config.api_base_url)?;
        let mut payments_client = PaymentsClient::new(
            config.access_token.clone().unwrap_or_default(),
            payments_base,
            http.clone(),
        );
        if let Some(version) = config.square_version.as_deref() {
            payments_client = payments_client.with_api_version(version);
        }
        let payment_executor = Arc::new(IdempotentExecutor::new(
            config.idempotency_ttl,
            Some(config.outbound_timeout + EXECUTOR_TIMEOUT_GRACE),
        ));
        let payments = PaymentGateway::new(
            payments_client,
            instrumented_breaker(PAYMENTS_DEPENDENCY, breaker_config),
            payment_executor.clone(),
        );

        let shipping_base = parse_base_url("shipping", &config.shipping_api_base_url)?;
        let mut shipping_client = ShippingClient::new(shipping_base, http);
        if let Some(token) = config.access_token.as_deref() {
            shipping_client = shipping_client.with_access_token(token);
        }
        let shipping = ShippingGateway::new(
            shipping_client,
            instrumented_breaker(SHIPPING_DEPENDENCY, breaker_config),
        );

        let admission = AdmissionPolicy::new(
            SigningSecrets::new(
                config.webhook_signature_key.clone(),
                config.sandbox_webhook_signature_key.clone(),
            ),
            config.max_event_age,
            config.max_body_bytes,
        );
        let dispatcher = Dispatcher::new(
            Arc::new(LoggingEventHandler),
            RetryClassifier::default(),
            storage.event_ledger(),
            config.event_retry_max_attempts,
            clock.clone(),
        );

        Ok(Self {
            metrics,
            storage,
            admission,
            dispatcher,
            payments,
            shipping,
            payment_executor,
            notification_url: config.notification_url.clone(),
            max_body_bytes: config.max_body_bytes,
            claim_lease: chrono::Duration::from_std(config.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            api_auth_token: config.api_auth_token.as_deref().map(Arc::from),
            clock,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.admission = self.admission.with_clock(clock.clone());
        self.dispatcher = self.dispatcher.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.dispatcher = self.dispatcher.with_handler(handler);
        self
    }

    /// Caps the in-request sleep between processing attempts.
    pub fn with_max_inline_delay(mut self, delay: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_max_inline_delay(delay);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn admission(&self) -> &AdmissionPolicy {
        &self.admission
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn payments(&self) -> &PaymentGateway {
        &self.payments
    }

    pub fn shipping(&self) -> &ShippingGateway {
        &self.shipping
    }

    pub fn payment_executor(&self) -> Arc<IdempotentExecutor<Payment>> {
        self.payment_executor.clone()
    }

    pub fn notification_url(&self) -> Option<&str> {
        self.notification_url.as_deref()
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        self.claim_lease
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.payments.breaker().snapshot(),
            self.shipping.breaker().snapshot(),
        ]
    }
}

fn parse_base_url(name: &'static str, raw: &str) -> Result<Url, AppStateError> {
    // `Url::join` drops the last path segment unless the base ends with '/'.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|source| AppStateError::BaseUrl { name, source })
}

pub fn app_router(state: AppState) -> Router {
    // Bodies one byte over the admission limit still reach admission; larger
    // ones are refused by axum with the same 413.
    let body_limit = state.max_body_bytes.saturating_add(1);
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/breakers", get(debug_breakers))
        .route(
            "/webhooks/square",
            post(webhook::handle).layer(DefaultBodyLimit::max(body_limit)),
        );

    // The API moves money with the merchant's token; it is only served
    // behind a configured bearer token.
    if state.api_auth_token.is_some() {
        let api = Router::new()
            .route("/api/payments", post(create_payment))
            .route("/api/shipping/quote", post(shipping_quote))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_api_token,
            ));
        router = router.merge(api);
    }

    router.with_state(state)
}

async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let authorized = match (state.api_auth_token.as_deref(), presented) {
        (Some(expected), Some(presented)) => {
            bool::from(expected.as_bytes().ct_eq(presented.trim().as_bytes()))
        }
        _ => false,
    };
    if !authorized {
        warn!(
            stage = "app",
            path = %request.uri().path(),
            "api request without a valid bearer token"
        );
        return ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        )
        .into_response();
    }
    next.run(request).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct BreakersBody {
    breakers: Vec<BreakerSnapshot>,
}

async fn debug_breakers(State(state): State<AppState>) -> Json<BreakersBody> {
    Json(BreakersBody {
        breakers: state.breaker_snapshots(),
    })
}

async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<Payment>, ProblemResponse> {
    state
        .payments()
        .create_payment(&request)
        .await
        .map(Json)
        .map_err(|err| ProblemResponse::from_integration(&err))
}

async fn shipping_quote(
    State(state): State<AppState>,
    Json(request): Json<ShippingRateRequest>,
) -> Result<Json<ShippingQuote>, ProblemResponse> {
    state
        .shipping()
        .quote(&request)
        .await
        .map(Json)
        .map_err(|err| ProblemResponse::from_integration(&err))
}
