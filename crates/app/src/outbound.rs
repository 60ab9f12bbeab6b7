use std::sync::Arc;

use metrics::{counter, gauge};
use sqgate_core::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, Disposition, IdempotentExecutor,
    IntegrationError, StateObserver,
};
use sqgate_square::{
    CreatePaymentRequest, Payment, PaymentsClient, ShippingClient, ShippingQuote,
    ShippingRateRequest,
};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const PAYMENTS_DEPENDENCY: &str = "square_payments";
pub const SHIPPING_DEPENDENCY: &str = "shipping_rates";

/// Builds a breaker whose transitions are mirrored into the `breaker_state` gauge.
pub fn instrumented_breaker(name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
    let observer: StateObserver = Arc::new(|dependency: &str, state: BreakerState| {
        gauge!("breaker_state", "dependency" => dependency.to_string()).set(state.as_gauge());
    });
    gauge!("breaker_state", "dependency" => name.to_string()).set(BreakerState::Closed.as_gauge());
    Arc::new(CircuitBreaker::new(name, config).with_observer(observer))
}

fn note_rejection(err: &IntegrationError) {
    if let IntegrationError::CircuitOpen { dependency, .. } = err {
        counter!("breaker_rejections_total", "dependency" => dependency.clone()).increment(1);
    }
}

/// Payment creation guarded by a breaker and deduplicated by idempotency key.
#[derive(Clone)]
pub struct PaymentGateway {
    client: PaymentsClient,
    breaker: Arc<CircuitBreaker>,
    executor: Arc<IdempotentExecutor<Payment>>,
}

impl PaymentGateway {
    pub fn new(
        client: PaymentsClient,
        breaker: Arc<CircuitBreaker>,
        executor: Arc<IdempotentExecutor<Payment>>,
    ) -> Self {
        Self {
            client,
            breaker,
            executor,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Creates a payment. Concurrent or repeated requests with the same
    /// idempotency key share one upstream call while its result is retained.
    /// A key reused with a different request body is refused.
    pub async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<Payment, IntegrationError> {
        let key = request.idempotency_key.trim();
        if key.is_empty() {
            return Err(IntegrationError::Validation(
                "idempotency_key must not be empty".into(),
            ));
        }

        let fingerprint = request_fingerprint(request)?;
        let (result, disposition) = self
            .executor
            .execute_once_matching(key, &fingerprint, || async {
                self.breaker
                    .execute(|| async {
                        self.client
                            .create_payment(request)
                            .await
                            .map_err(IntegrationError::from)
                    })
                    .await
            })
            .await;

        if matches!(disposition, Disposition::Joined | Disposition::Replayed) {
            counter!("idempotency_hits_total", "disposition" => disposition.as_str())
                .increment(1);
        }
        match &result {
            Ok(payment) => info!(
                stage = "outbound",
                dependency = PAYMENTS_DEPENDENCY,
                idempotency_key = key,
                payment_id = %payment.id,
                disposition = disposition.as_str(),
                "payment created"
            ),
            Err(err) => {
                note_rejection(err);
                warn!(
                    stage = "outbound",
                    dependency = PAYMENTS_DEPENDENCY,
                    idempotency_key = key,
                    class = err.class().as_str(),
                    error = %err,
                    "payment call failed"
                );
            }
        }
        result
    }
}

fn request_fingerprint(request: &CreatePaymentRequest) -> Result<String, IntegrationError> {
    let encoded = serde_json::to_vec(request)
        .map_err(|err| IntegrationError::Validation(format!("unencodable request: {err}")))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Shipping rate lookups guarded by their own breaker.
#[derive(Clone)]
pub struct ShippingGateway {
    client: ShippingClient,
    breaker: Arc<CircuitBreaker>,
}

impl ShippingGateway {
    pub fn new(client: ShippingClient, breaker: Arc<CircuitBreaker>) -> Self {
        Self { client, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn quote(
        &self,
        request: &ShippingRateRequest,
    ) -> Result<ShippingQuote, IntegrationError> {
        let result = self
            .breaker
            .execute(|| async {
                self.client
                    .quote(request)
                    .await
                    .map_err(IntegrationError::from)
            })
            .await;
        if let Err(err) = &result {
            note_rejection(err);
            warn!(
                stage = "outbound",
                dependency = SHIPPING_DEPENDENCY,
                class = err.class().as_str(),
                error = %err,
                "shipping quote failed"
            );
        }
        result
    }
}
