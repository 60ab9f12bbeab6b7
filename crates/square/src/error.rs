use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use sqgate_core::IntegrationError;
use thiserror::Error;

/// Errors produced by the provider clients.
#[derive(Debug, Error)]
pub enum SquareError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {message}")]
    Status {
        status: StatusCode,
        detail: Option<ProviderErrorDetail>,
        message: String,
    },
}

/// First entry of a Square `errors` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderErrorDetail {
    pub category: Option<String>,
    pub code: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ProviderErrorDetail>,
}

impl From<SquareError> for IntegrationError {
    fn from(err: SquareError) -> Self {
        match err {
            SquareError::Http(err) if err.is_timeout() => {
                IntegrationError::Timeout(err.to_string())
            }
            SquareError::Http(err) if err.is_connect() => {
                IntegrationError::Connection(err.to_string())
            }
            SquareError::Http(err) if err.is_decode() => IntegrationError::Other(format!(
                "unreadable provider response: {err}"
            )),
            SquareError::Http(err) => match err.status() {
                Some(status) => IntegrationError::http(status.as_u16(), err.to_string()),
                None => IntegrationError::Connection(err.to_string()),
            },
            SquareError::Status {
                status,
                detail,
                message,
            } => IntegrationError::Http {
                status: status.as_u16(),
                code: detail.and_then(|d| d.code),
                message,
            },
            SquareError::Url(err) => IntegrationError::Validation(err.to_string()),
        }
    }
}

pub(crate) async fn parse_json<T>(response: Response) -> Result<T, SquareError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, response).await);
    }

    Ok(response.json().await?)
}

async fn status_error(status: StatusCode, response: Response) -> SquareError {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"));
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|parsed| parsed.errors.into_iter().next());
    let message = detail
        .as_ref()
        .and_then(|d| d.detail.clone().or_else(|| d.code.clone()))
        .unwrap_or(body);
    SquareError::Status {
        status,
        detail,
        message,
    }
}
