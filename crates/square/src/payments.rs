use std::fmt;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{parse_json, SquareError};

/// API version pinned on every request.
pub const DEFAULT_SQUARE_VERSION: &str = "2024-07-17";

/// Client for the Square Payments API.
#[derive(Clone)]
pub struct PaymentsClient {
    http: Client,
    base_url: Url,
    access_token: String,
    api_version: String,
}

impl fmt::Debug for PaymentsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentsClient")
            .field("base_url", &self.base_url.as_str())
            .field("access_token", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl PaymentsClient {
    pub fn new(access_token: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            access_token: access_token.into(),
            api_version: DEFAULT_SQUARE_VERSION.to_string(),
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Creates a payment. Square deduplicates on `idempotency_key`.
    pub async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<Payment, SquareError> {
        let url = self.base_url.join("v2/payments")?;
        let response = self
            .http
            .request(Method::POST, url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Square-Version", &self.api_version)
            .json(request)
            .send()
            .await?;

        parse_json::<PaymentEnvelope>(response)
            .await
            .map(|envelope| envelope.payment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Smallest currency unit, e.g. cents.
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub source_id: String,
    pub idempotency_key: String,
    pub amount_money: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autocomplete: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub status: String,
    pub amount_money: Money,
    pub location_id: Option<String>,
    pub order_id: Option<String>,
    pub receipt_url: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelope {
    payment: Payment,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use sqgate_core::IntegrationError;
    use std::time::Duration;

    fn client(base_url: &Url, http: Client) -> PaymentsClient {
        PaymentsClient::new("sq0atp-token", base_url.clone(), http)
    }

    fn request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            source_id: "cnon:card-nonce-ok".into(),
            idempotency_key: "order-42".into(),
            amount_money: Money {
                amount: 1999,
                currency: "USD".into(),
            },
            location_id: Some("L1".into()),
            reference_id: None,
            note: None,
            autocomplete: Some(true),
        }
    }

    #[tokio::test]
    async fn create_payment_sends_headers_and_parses_payment() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/payments")
                    .header("Authorization", "Bearer sq0atp-token")
                    .header("Square-Version", DEFAULT_SQUARE_VERSION)
                    .json_body_partial(
                        json!({
                            "idempotency_key": "order-42",
                            "amount_money": {"amount": 1999, "currency": "USD"}
                        })
                        .to_string(),
                    );
                then.status(200).json_body(json!({
                    "payment": {
                        "id": "pay_1",
                        "status": "COMPLETED",
                        "amount_money": {"amount": 1999, "currency": "USD"},
                        "location_id": "L1",
                        "created_at": "2024-06-01T12:00:00Z"
                    }
                }));
            })
            .await;

        let payment = client(&base, Client::new())
            .create_payment(&request())
            .await
            .expect("payment");
        mock.assert_async().await;

        assert_eq!(payment.id, "pay_1");
        assert_eq!(payment.status, "COMPLETED");
        assert_eq!(payment.amount_money.amount, 1999);
    }

    #[tokio::test]
    async fn provider_error_maps_to_http_error_with_code() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/payments");
                then.status(403).json_body(json!({
                    "errors": [{
                        "category": "AUTHENTICATION_ERROR",
                        "code": "FORBIDDEN",
                        "detail": "Merchant mismatch for location L1"
                    }]
                }));
            })
            .await;

        let err = client(&base, Client::new())
            .create_payment(&request())
            .await
            .expect_err("should fail");
        assert_eq!(
            IntegrationError::from(err),
            IntegrationError::Http {
                status: 403,
                code: Some("FORBIDDEN".into()),
                message: "Merchant mismatch for location L1".into(),
            }
        );
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept_as_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/payments");
                then.status(502).body("bad gateway");
            })
            .await;

        let err = client(&base, Client::new())
            .create_payment(&request())
            .await
            .expect_err("should fail");
        let err = IntegrationError::from(err);
        assert_eq!(err, IntegrationError::http(502, "bad gateway"));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/payments");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let http = Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .expect("client");
        let err = client(&base, http)
            .create_payment(&request())
            .await
            .expect_err("should time out");
        assert!(matches!(IntegrationError::from(err), IntegrationError::Timeout(_)));
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_connection_error() {
        let base = Url::parse("http://127.0.0.1:9/").expect("url");
        let err = client(&base, Client::new())
            .create_payment(&request())
            .await
            .expect_err("should fail");
        assert!(matches!(IntegrationError::from(err), IntegrationError::Connection(_)));
    }

    #[test]
    fn debug_redacts_token() {
        let base = Url::parse("https://connect.squareup.com/").expect("url");
        let client = client(&base, Client::new());
        assert!(!format!("{client:?}").contains("sq0atp-token"));
    }
}
