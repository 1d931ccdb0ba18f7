//! Configuration management for toolrelay.
//!
//! Handles loading configuration from TOML files and turning it into a
//! service registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::mcp::{
    CachePolicy, ClientConfig, HealthPolicy, HttpToolClient, ProtocolClient, RegistryBuilder,
    ServiceProfile, ServiceSettings, StreamingSettings, ToolCatalog, ToolManifest,
    ValidationReport,
};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry settings
    pub registry: RegistryConfig,

    /// Health monitoring
    pub health: HealthPolicy,

    /// Result caching
    pub cache: CachePolicy,

    /// Retry backoff
    pub retry: RetryPolicy,

    /// Streaming wrapper
    pub streaming: StreamingSettings,

    /// Tool services
    pub services: Vec<ServiceEntry>,

    /// Tool manifests
    pub tools: Vec<ToolManifest>,
}

/// Registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ask services without declared tools for their tool list
    pub discover_tools: bool,

    /// Start the health monitor as soon as the registry is built
    pub monitor_on_start: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { discover_tools: true, monitor_on_start: false }
    }
}

/// Configuration for a single tool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service name (unique identifier)
    pub name: String,

    /// Built-in profile to start from (defaults to `name` when it is one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Server endpoint
    #[serde(default, alias = "serverUrl", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retries after the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Look up `<NAME>_MCP_URL` when no URL is configured
    #[serde(default, alias = "autoDetect", skip_serializing_if = "Option::is_none")]
    pub auto_detect: Option<bool>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub priority: i32,

    /// Tools offered, replacing the profile's list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    /// Health endpoint path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ServiceEntry {
    /// Create an entry with every optional setting left unset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profile: None,
            server_url: None,
            timeout_ms: None,
            retries: None,
            auto_detect: None,
            enabled: true,
            priority: 0,
            tools: Vec::new(),
            health_path: None,
        }
    }

    /// Set the server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Explicit client settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server_url.clone(),
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            auto_detect: self.auto_detect,
        }
    }

    /// Resolve the service profile, applying overrides.
    pub fn profile(&self) -> anyhow::Result<ServiceProfile> {
        let base = match &self.profile {
            Some(profile) => Some(
                ServiceProfile::builtin(profile)
                    .with_context(|| format!("Unknown service profile '{}'", profile))?,
            ),
            None => ServiceProfile::builtin(&self.name),
        };

        let mut profile = match base {
            Some(base) if base.name == self.name => base,
            Some(base) => {
                let mut renamed = ServiceProfile::new(&self.name, base.default_server_url)
                    .with_tools(base.tools)
                    .with_health_path(base.health_path);
                renamed.required_env = base.required_env;
                renamed
            }
            None => ServiceProfile::new(&self.name, self.server_url.clone().unwrap_or_default()),
        };

        if !self.tools.is_empty() {
            profile.tools = self.tools.clone();
        }
        if let Some(path) = &self.health_path {
            profile.health_path = path.clone();
        }
        Ok(profile)
    }

    /// Build the protocol client for this entry.
    pub fn build_client(&self) -> anyhow::Result<HttpToolClient> {
        let client = HttpToolClient::new(self.profile()?, &self.client_config())
            .with_context(|| format!("Failed to create client for service '{}'", self.name))?;
        Ok(client)
    }

    /// Registry settings for this entry.
    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings { enabled: self.enabled, priority: self.priority }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.toolrelay.toml` in current directory
    /// 2. `~/.config/toolrelay/config.toml`
    /// 3. Falls back to defaults
    ///
    /// A `.env` file in the current directory is loaded first so that
    /// `<NAME>_MCP_URL` variables take part in URL detection.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let local_config = PathBuf::from(".toolrelay.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), services = config.services.len(), "Loaded configuration");
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("toolrelay"))
    }

    /// Check the configuration without contacting any service.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();

        let mut names = HashSet::new();
        for entry in &self.services {
            if !names.insert(entry.name.clone()) {
                report.error(format!("service '{}' is defined twice", entry.name));
            }
            match entry.build_client() {
                Ok(client) => {
                    let client_report = client.validate_configuration();
                    for error in client_report.errors {
                        report.error(format!("{}: {}", entry.name, error));
                    }
                    for warning in client_report.warnings {
                        report.warning(format!("{}: {}", entry.name, warning));
                    }
                }
                Err(e) => report.error(format!("{}: {:#}", entry.name, e)),
            }
        }

        let catalog: ToolCatalog = self.tools.iter().cloned().collect();
        report.merge(catalog.validate(&names));

        if self.health.failure_threshold == 0 {
            report.error("health.failure_threshold must be at least 1");
        }
        if self.health.probe_timeout_ms == 0 {
            report.error("health.probe_timeout_ms must be positive");
        }
        if self.health.aggregate_timeout_ms < self.health.probe_timeout_ms {
            report.warning("health.aggregate_timeout_ms is shorter than a single probe");
        }
        if self.retry.backoff_multiplier < 1.0 {
            report.warning("retry.backoff_multiplier below 1.0 shrinks delays");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            report.error("retry.jitter_ratio must be between 0 and 1");
        }

        report
    }

    /// Registry builder with every configured service and manifest.
    pub fn registry_builder(&self) -> anyhow::Result<RegistryBuilder> {
        let mut builder = RegistryBuilder::new()
            .health_policy(self.health.clone())
            .cache_policy(self.cache.clone())
            .retry_policy(self.retry.clone())
            .manifests(self.tools.iter().cloned());

        for entry in &self.services {
            let client: Arc<dyn ProtocolClient> = Arc::new(entry.build_client()?);
            builder = builder.register_with(client, entry.settings());
        }

        Ok(builder)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            health: HealthPolicy::default(),
            cache: CachePolicy::default(),
            retry: RetryPolicy::default(),
            streaming: StreamingSettings::default(),
            services: vec![ServiceEntry::new("google_workspace"), ServiceEntry::new("asana")],
            tools: Vec::new(),
        }
    }
}
