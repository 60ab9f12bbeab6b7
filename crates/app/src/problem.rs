use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqgate_core::IntegrationError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
    retry_after_secs: Option<u64>,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
            retry_after_secs: None,
        }
    }

    /// Adds a `Retry-After` header, rounded up to whole seconds.
    pub fn with_retry_after_ms(mut self, millis: u64) -> Self {
        self.retry_after_secs = Some(millis.div_ceil(1000).max(1));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn problem_type(&self) -> &'static str {
        self.body.problem_type
    }

    /// Renders an outbound failure for API callers.
    pub fn from_integration(err: &IntegrationError) -> Self {
        match err {
            IntegrationError::CircuitOpen {
                dependency,
                retry_after_ms,
            } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "circuit_open",
                format!("{dependency} is temporarily unavailable"),
            )
            .with_retry_after_ms(*retry_after_ms),
            IntegrationError::Timeout(_) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                "upstream call timed out",
            ),
            IntegrationError::Http { status: 429, .. } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "upstream rate limit reached",
            ),
            IntegrationError::Http { status, message, .. } if (400..500).contains(status) => {
                Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "provider_rejected",
                    message.clone(),
                )
            }
            IntegrationError::Http { .. } | IntegrationError::Connection(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "upstream dependency failed",
            ),
            IntegrationError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", message.clone())
            }
            IntegrationError::Cancelled(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "cancelled",
                "request was cancelled before completing",
            ),
            IntegrationError::Structured { .. }
            | IntegrationError::Persistence { .. }
            | IntegrationError::Other(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "request failed",
            ),
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
