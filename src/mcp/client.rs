//! Protocol client contract.
//!
//! Every external tool service plugs in behind [`ProtocolClient`]. A client
//! makes exactly one network attempt per call and reports failures as
//! [`McpError`]; retries are the caller's job.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::McpError;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 2;

/// Explicit client settings, as supplied by configuration.
///
/// Every field is optional; missing values are filled from detection and
/// defaults by [`ClientConfiguration::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint URL
    #[serde(default, alias = "serverUrl", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Per-call timeout in milliseconds
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Whether to look for the server URL in the environment
    #[serde(default, alias = "autoDetect", skip_serializing_if = "Option::is_none")]
    pub auto_detect: Option<bool>,
}

/// Effective client settings after merging explicit config with detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfiguration {
    /// Server endpoint URL
    pub server_url: String,
    /// Per-call timeout
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Retries after the first attempt
    pub retries: u32,
    /// Whether the URL may come from the environment
    pub auto_detect: bool,
}

impl ClientConfiguration {
    /// Merge explicit settings, a detected URL and the service default.
    ///
    /// URL precedence: explicit, then detected (only with auto-detect on),
    /// then the service default.
    pub fn resolve(
        explicit: &ClientConfig,
        detect: impl FnOnce() -> Option<String>,
        default_url: &str,
    ) -> Self {
        let auto_detect = explicit.auto_detect.unwrap_or(true);
        let server_url = explicit
            .server_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| if auto_detect { detect() } else { None })
            .unwrap_or_else(|| default_url.to_string());

        Self {
            server_url,
            timeout: explicit.timeout_ms.map_or(DEFAULT_TIMEOUT, Duration::from_millis),
            retries: explicit.retries.unwrap_or(DEFAULT_RETRIES),
            auto_detect,
        }
    }

    /// Total attempts allowed per call (first attempt plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Outcome of a configuration check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Problems that make the client unusable
    pub errors: Vec<String>,
    /// Problems worth reporting that do not block use
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a blocking problem.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record a non-blocking problem.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Append another report's findings.
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Whether no blocking problems were found.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks that apply to every client regardless of service.
pub fn validate_generic(config: &ClientConfiguration) -> ValidationReport {
    let mut report = ValidationReport::new();

    match Url::parse(&config.server_url) {
        Ok(url) => {
            if !matches!(url.scheme(), "http" | "https") {
                report.error(format!("unsupported URL scheme '{}'", url.scheme()));
            }
            if url.host_str().is_none() {
                report.error("server URL has no host");
            }
            if url.scheme() == "http"
                && !matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "::1"))
            {
                report.warning("server URL uses plain HTTP to a remote host");
            }
        }
        Err(e) => report.error(format!("invalid server URL '{}': {}", config.server_url, e)),
    }

    if config.timeout.is_zero() {
        report.error("timeout must be positive");
    } else if config.timeout > Duration::from_secs(300) {
        report.warning("timeout is longer than five minutes");
    }

    if config.retries > 10 {
        report.warning(format!("{} retries may hammer an unhealthy service", config.retries));
    }

    report
}

/// Health probe result as reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Service responded normally
    Healthy,
    /// Service responded but reported a problem
    Degraded,
    /// Service could not be reached or failed
    Unhealthy,
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Probe verdict
    pub status: ProbeStatus,
    /// Reason, when not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    /// A healthy probe.
    pub fn healthy() -> Self {
        Self { status: ProbeStatus::Healthy, error: None }
    }

    /// A probe that reached the service but found a problem.
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self { status: ProbeStatus::Degraded, error: Some(reason.into()) }
    }

    /// A failed probe.
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self { status: ProbeStatus::Unhealthy, error: Some(reason.into()) }
    }
}

/// Contract implemented by every external tool service.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Unique service name.
    fn service_name(&self) -> &str;

    /// URL used when neither config nor detection provides one.
    fn default_server_url(&self) -> &str;

    /// Tools this service is known to offer.
    fn supported_tools(&self) -> &[String];

    /// Look for a server URL in the environment.
    fn detect_server_url(&self) -> Option<String>;

    /// Service-specific configuration checks.
    fn validate_service_specific(&self) -> ValidationReport;

    /// Effective configuration.
    fn configuration(&self) -> &ClientConfiguration;

    /// Execute a tool with a single network attempt.
    async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value, McpError>;

    /// Probe the service.
    async fn health_check(&self) -> ProbeResult;

    /// Ask the service which tools it offers.
    async fn discover_tools(&self) -> Result<Vec<String>, McpError> {
        Ok(self.supported_tools().to_vec())
    }

    /// Whether the service produces incremental output itself.
    fn supports_native_streaming(&self) -> bool {
        false
    }

    /// Execute a tool, forwarding incremental output to `partial` as the
    /// service produces it. The returned value is the complete result.
    ///
    /// Clients without native streaming simply run [`Self::execute_tool`].
    async fn execute_tool_streaming(
        &self,
        name: &str,
        args: &Value,
        partial: mpsc::UnboundedSender<Value>,
    ) -> Result<Value, McpError> {
        drop(partial);
        self.execute_tool(name, args).await
    }

    /// Generic checks combined with the service-specific ones.
    fn validate_configuration(&self) -> ValidationReport {
        let mut report = validate_generic(self.configuration());
        report.merge(self.validate_service_specific());
        report
    }

    /// Whether the client is configured well enough to be used.
    fn is_available(&self) -> bool {
        self.validate_configuration().is_valid()
    }
}

impl fmt::Debug for dyn ProtocolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("service", &self.service_name())
            .field("server_url", &self.configuration().server_url)
            .finish()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
