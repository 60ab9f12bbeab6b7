use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const HEADER_SHA256_SIGNATURE: &str = "x-square-hmacsha256-signature";
pub const HEADER_SHA1_SIGNATURE: &str = "x-square-hmacsha1-signature";
pub const HEADER_ENVIRONMENT: &str = "square-environment";

/// Request headers relevant to webhook admission, extracted by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub sha256_signature: Option<String>,
    pub sha1_signature: Option<String>,
    pub environment: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

impl WebhookHeaders {
    /// Builds the header set from `(name, value)` pairs. Names are matched
    /// case-insensitively; the first occurrence of a header wins.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            let slot = match name.to_ascii_lowercase().as_str() {
                HEADER_SHA256_SIGNATURE => &mut headers.sha256_signature,
                HEADER_SHA1_SIGNATURE => &mut headers.sha1_signature,
                HEADER_ENVIRONMENT => &mut headers.environment,
                "host" => &mut headers.host,
                "user-agent" => &mut headers.user_agent,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        headers
    }

    /// Returns `true` when at least one non-empty signature header is present.
    pub fn has_signature(&self) -> bool {
        [&self.sha256_signature, &self.sha1_signature]
            .into_iter()
            .any(|value| value.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

/// Webhook notification as delivered by Square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub merchant_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub data: EventData,
}

/// The `data` block of a notification. `object` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(rename = "type")]
    pub object_type: String,
    pub id: String,
    #[serde(default)]
    pub object: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("request body is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload does not match the webhook schema: {0}")]
    Schema(String),
}

impl WebhookEnvelope {
    /// Parses and validates a raw notification body.
    ///
    /// Bodies that are not JSON yield [`EnvelopeError::Malformed`]; JSON that
    /// does not describe a notification yields [`EnvelopeError::Schema`].
    pub fn parse(raw_body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(raw_body)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        if !value.is_object() {
            return Err(EnvelopeError::Schema("top-level value must be an object".into()));
        }

        let envelope: Self =
            serde_json::from_value(value).map_err(|err| EnvelopeError::Schema(err.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let required = [
            ("event_id", &self.event_id),
            ("type", &self.event_type),
            ("merchant_id", &self.merchant_id),
            ("data.type", &self.data.object_type),
            ("data.id", &self.data.id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(EnvelopeError::Schema(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    /// Returns `true` for payment related notifications (`payment.*`, `refund.*`).
    pub fn is_payment_event(&self) -> bool {
        is_payment_event_type(&self.event_type)
    }
}

pub fn is_payment_event_type(event_type: &str) -> bool {
    event_type.starts_with("payment.") || event_type.starts_with("refund.")
}
