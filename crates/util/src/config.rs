use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://sqgate.db?mode=rwc";
pub const DEFAULT_SQUARE_API_BASE_URL: &str = "https://connect.squareup.com/";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
        })
    }
}

/// Settings for the Square integration: webhook admission, breakers,
/// idempotency and outbound clients.
///
/// Signing keys are kept exactly as read. Consumers sanitize them on every
/// use through [`crate::sanitize_secret`].
#[derive(Clone)]
pub struct IntegrationConfig {
    pub webhook_signature_key: Option<String>,
    pub sandbox_webhook_signature_key: Option<String>,
    pub notification_url: Option<String>,
    pub access_token: Option<String>,
    /// Overrides the `Square-Version` header sent with API calls.
    pub square_version: Option<String>,
    pub api_base_url: String,
    pub shipping_api_base_url: String,
    pub max_event_age: Duration,
    pub max_body_bytes: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub outbound_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub event_retry_max_attempts: u32,
    /// How long a processing claim on a ledger row is honoured before a
    /// redelivery may take it over.
    pub claim_lease: Duration,
    /// Bearer token required by the `/api` routes. The routes are not served
    /// when unset.
    pub api_auth_token: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            webhook_signature_key: None,
            sandbox_webhook_signature_key: None,
            notification_url: None,
            access_token: None,
            square_version: None,
            api_base_url: DEFAULT_SQUARE_API_BASE_URL.to_string(),
            shipping_api_base_url: DEFAULT_SQUARE_API_BASE_URL.to_string(),
            max_event_age: Duration::from_secs(300),
            max_body_bytes: 256 * 1024,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            outbound_timeout: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            event_retry_max_attempts: 3,
            claim_lease: Duration::from_secs(300),
            api_auth_token: None,
        }
    }
}

impl fmt::Debug for IntegrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationConfig")
            .field(
                "webhook_signature_key",
                &self.webhook_signature_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "sandbox_webhook_signature_key",
                &self.sandbox_webhook_signature_key.as_ref().map(|_| "<redacted>"),
            )
            .field("notification_url", &self.notification_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("square_version", &self.square_version)
            .field("api_base_url", &self.api_base_url)
            .field("shipping_api_base_url", &self.shipping_api_base_url)
            .field("max_event_age", &self.max_event_age)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("breaker_failure_threshold", &self.breaker_failure_threshold)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .field("outbound_timeout", &self.outbound_timeout)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("event_retry_max_attempts", &self.event_retry_max_attempts)
            .field("claim_lease", &self.claim_lease)
            .field("api_auth_token", &self.api_auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl IntegrationConfig {
    /// Reads the integration settings from the environment, falling back to
    /// [`IntegrationConfig::default`] for every unset value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_event_age = Duration::from_secs(read_number(
            "WEBHOOK_MAX_EVENT_AGE_SECS",
            defaults.max_event_age.as_secs(),
        )?);
        let max_body_bytes = read_number("WEBHOOK_MAX_BODY_BYTES", defaults.max_body_bytes)?;
        let breaker_failure_threshold = read_number(
            "BREAKER_FAILURE_THRESHOLD",
            defaults.breaker_failure_threshold,
        )?;
        if breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "BREAKER_FAILURE_THRESHOLD",
                value: "0".to_string(),
            });
        }
        let breaker_cooldown = Duration::from_secs(read_number(
            "BREAKER_COOLDOWN_SECS",
            defaults.breaker_cooldown.as_secs(),
        )?);
        let outbound_timeout = Duration::from_secs(read_number(
            "OUTBOUND_TIMEOUT_SECS",
            defaults.outbound_timeout.as_secs(),
        )?);
        let idempotency_ttl = Duration::from_secs(read_number(
            "IDEMPOTENCY_TTL_SECS",
            defaults.idempotency_ttl.as_secs(),
        )?);
        let event_retry_max_attempts = read_number(
            "EVENT_RETRY_MAX_ATTEMPTS",
            defaults.event_retry_max_attempts,
        )?;
        let claim_lease = Duration::from_secs(read_number(
            "WEBHOOK_CLAIM_LEASE_SECS",
            defaults.claim_lease.as_secs(),
        )?);

        Ok(Self {
            webhook_signature_key: read_optional("SQUARE_WEBHOOK_SIGNATURE_KEY"),
            sandbox_webhook_signature_key: read_optional("SQUARE_SANDBOX_WEBHOOK_SIGNATURE_KEY"),
            notification_url: read_optional("SQUARE_WEBHOOK_NOTIFICATION_URL"),
            access_token: read_optional("SQUARE_ACCESS_TOKEN"),
            square_version: read_optional("SQUARE_VERSION"),
            api_base_url: read_optional("SQUARE_API_BASE_URL").unwrap_or(defaults.api_base_url),
            shipping_api_base_url: read_optional("SHIPPING_API_BASE_URL")
                .unwrap_or(defaults.shipping_api_base_url),
            max_event_age,
            max_body_bytes,
            breaker_failure_threshold,
            breaker_cooldown,
            outbound_timeout,
            idempotency_ttl,
            event_retry_max_attempts,
            claim_lease,
            api_auth_token: read_optional("API_AUTH_TOKEN"),
        })
    }
}

fn read_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a positive number (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
