use serde::Serialize;

use crate::envelope::WebhookHeaders;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEnvironment {
    Sandbox,
    Production,
}

impl WebhookEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }

    fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Some(Self::Sandbox),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Strategy deciding which environment an inbound webhook belongs to.
///
/// The provider only states the environment on some deliveries, so
/// implementations fall back to heuristics.
pub trait EnvironmentDetector: Send + Sync {
    fn detect(&self, headers: &WebhookHeaders) -> WebhookEnvironment;
}

/// Default detector: explicit header, then hostname markers, then user-agent
/// markers, otherwise production.
#[derive(Debug, Clone)]
pub struct HeuristicEnvironmentDetector {
    host_markers: Vec<String>,
    user_agent_markers: Vec<String>,
}

impl Default for HeuristicEnvironmentDetector {
    fn default() -> Self {
        Self {
            host_markers: ["staging", "dev", "localhost", "sandbox"]
                .into_iter()
                .map(String::from)
                .collect(),
            user_agent_markers: vec!["sandbox".to_string()],
        }
    }
}

impl HeuristicEnvironmentDetector {
    pub fn new(host_markers: Vec<String>, user_agent_markers: Vec<String>) -> Self {
        Self {
            host_markers,
            user_agent_markers,
        }
    }

    /// Detector that trusts only the explicit header.
    pub fn header_only() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

fn contains_marker(value: Option<&str>, markers: &[String]) -> bool {
    let Some(value) = value else {
        return false;
    };
    let lowered = value.to_ascii_lowercase();
    markers
        .iter()
        .any(|marker| lowered.contains(marker.as_str()))
}

impl EnvironmentDetector for HeuristicEnvironmentDetector {
    fn detect(&self, headers: &WebhookHeaders) -> WebhookEnvironment {
        if let Some(explicit) = headers
            .environment
            .as_deref()
            .and_then(WebhookEnvironment::from_header)
        {
            return explicit;
        }

        if contains_marker(headers.host.as_deref(), &self.host_markers)
            || contains_marker(headers.user_agent.as_deref(), &self.user_agent_markers)
        {
            return WebhookEnvironment::Sandbox;
        }

        WebhookEnvironment::Production
    }
}
