use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{parse_json, SquareError};
use crate::payments::Money;

/// Client for the carrier rate-quote service used at checkout.
#[derive(Clone)]
pub struct ShippingClient {
    http: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl std::fmt::Debug for ShippingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShippingClient")
            .field("base_url", &self.base_url.as_str())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ShippingClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Requests rate quotes for a parcel.
    pub async fn quote(&self, request: &ShippingRateRequest) -> Result<ShippingQuote, SquareError> {
        let url = self.base_url.join("v2/shipping/rates")?;
        let mut builder = self.http.request(Method::POST, url).json(request);
        if let Some(token) = &self.access_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let response = builder.send().await?;
        parse_json(response).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address_line_1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_line_2: Option<String>,
    pub locality: String,
    pub administrative_district_level_1: String,
    pub postal_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingItem {
    pub sku: String,
    pub quantity: u32,
    pub weight_grams: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRateRequest {
    pub destination: Address,
    pub items: Vec<ShippingItem>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRate {
    pub carrier: String,
    pub service: String,
    pub amount_money: Money,
    pub estimated_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingQuote {
    #[serde(default)]
    pub rates: Vec<ShippingRate>,
}

impl ShippingQuote {
    /// Cheapest rate, if any were offered.
    pub fn cheapest(&self) -> Option<&ShippingRate> {
        self.rates.iter().min_by_key(|rate| rate.amount_money.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use sqgate_core::IntegrationError;

    fn request() -> ShippingRateRequest {
        ShippingRateRequest {
            destination: Address {
                address_line_1: "500 Electric Ave".into(),
                address_line_2: None,
                locality: "New York".into(),
                administrative_district_level_1: "NY".into(),
                postal_code: "10003".into(),
                country: "US".into(),
            },
            items: vec![ShippingItem {
                sku: "MUG-01".into(),
                quantity: 2,
                weight_grams: 450,
            }],
            currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn quote_parses_rates() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/shipping/rates")
                    .header("Authorization", "Bearer ship-token")
                    .json_body_partial(r#"{"destination":{"postal_code":"10003"}}"#);
                then.status(200).json_body(json!({
                    "rates": [
                        {
                            "carrier": "UPS",
                            "service": "Ground",
                            "amount_money": {"amount": 1250, "currency": "USD"},
                            "estimated_days": 4
                        },
                        {
                            "carrier": "USPS",
                            "service": "Priority",
                            "amount_money": {"amount": 980, "currency": "USD"}
                        }
                    ]
                }));
            })
            .await;

        let quote = ShippingClient::new(base, Client::new())
            .with_access_token("ship-token")
            .quote(&request())
            .await
            .expect("quote");
        mock.assert_async().await;

        assert_eq!(quote.rates.len(), 2);
        assert_eq!(quote.cheapest().map(|r| r.carrier.as_str()), Some("USPS"));
    }

    #[tokio::test]
    async fn invalid_address_is_a_caller_error() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/shipping/rates");
                then.status(400).json_body(json!({
                    "errors": [{
                        "category": "INVALID_REQUEST_ERROR",
                        "code": "INVALID_POSTAL_CODE",
                        "detail": "postal code does not match state"
                    }]
                }));
            })
            .await;

        let err = ShippingClient::new(base, Client::new())
            .quote(&request())
            .await
            .expect_err("should fail");
        let err = IntegrationError::from(err);
        assert!(!err.is_infrastructure());
        assert!(matches!(
            err,
            IntegrationError::Http { status: 400, ref code, .. }
                if code.as_deref() == Some("INVALID_POSTAL_CODE")
        ));
    }
}
