//! Tool manifests and the tool catalog.
//!
//! A manifest describes one tool as offered by one service: who owns it,
//! how it should be ranked, whether its results may be cached and how it
//! behaves when streamed. The catalog is loaded from configuration and
//! checked once against the known services.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::client::ValidationReport;

/// Verbs that mark a tool as mutating; such tools are never cached.
const MUTATING_VERBS: &[&str] = &[
    "create", "update", "delete", "send", "modify", "reply", "resolve", "set", "add", "remove",
    "start",
];

/// Whether a tool name reads as a state-changing operation.
///
/// The name is split on `_`; any segment equal to a mutating verb counts,
/// so `asana_create_task` and `send_message` are both mutating.
pub fn is_mutating_tool_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.split('_').any(|segment| MUTATING_VERBS.contains(&segment))
}

/// How a streamed tool produces its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Progress is synthesized while the blocking call runs
    #[default]
    Synthetic,
    /// The service streams on its own
    Native,
}

/// Streaming behaviour of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(rename = "type", default)]
    pub mode: StreamingMode,
    /// Status messages walked while the call is in flight
    #[serde(default, alias = "progressSteps", skip_serializing_if = "Vec::is_empty")]
    pub progress_steps: Vec<String>,
    /// Whether array results may be split into several data events
    #[serde(default, alias = "supportsPartialResults")]
    pub supports_partial_results: bool,
    /// Items per data event when results are split
    #[serde(default, alias = "chunkSize", skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: StreamingMode::Synthetic,
            progress_steps: vec![
                "Connecting to service".to_string(),
                "Processing request".to_string(),
                "Collecting results".to_string(),
            ],
            supports_partial_results: false,
            chunk_size: None,
        }
    }
}

/// Declaration of one tool offered by one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolManifest {
    /// Tool name as the model sees it
    pub id: String,
    /// Owning service
    pub service: String,
    #[serde(default, alias = "streamingSupported")]
    pub streaming_supported: bool,
    #[serde(default = "default_category")]
    pub category: String,
    /// Higher wins when several services offer the same tool
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    /// Typical run time, drives the synthetic progress cadence
    #[serde(default, alias = "estimatedDuration", skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, alias = "streamingConfig", skip_serializing_if = "Option::is_none")]
    pub streaming_config: Option<StreamingConfig>,
    /// Declares the tool free of side effects, making it cache-eligible
    #[serde(default, alias = "readOnly")]
    pub read_only: bool,
}

fn default_category() -> String {
    "general".to_string()
}

impl ToolManifest {
    /// Create a minimal manifest.
    pub fn new(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            streaming_supported: false,
            category: default_category(),
            priority: 0,
            description: String::new(),
            estimated_duration_ms: None,
            streaming_config: None,
            read_only: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Enable streaming with the given configuration.
    pub fn with_streaming(mut self, config: StreamingConfig) -> Self {
        self.streaming_supported = true;
        self.streaming_config = Some(config);
        self
    }

    /// Whether results of this tool may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.read_only && !is_mutating_tool_name(&self.id)
    }

    /// Streaming configuration, defaulted when streaming is on but unset.
    pub fn effective_streaming_config(&self) -> Option<StreamingConfig> {
        if !self.streaming_supported {
            return None;
        }
        Some(self.streaming_config.clone().unwrap_or_default())
    }

    /// Structural checks that do not need the service list.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();
        if self.id.trim().is_empty() {
            report.error("tool manifest has an empty id");
        }
        if self.service.trim().is_empty() {
            report.error(format!("tool '{}' has no service", self.id));
        }
        if let Some(config) = &self.streaming_config {
            if config.chunk_size == Some(0) {
                report.error(format!("tool '{}' has a zero chunk size", self.id));
            }
            if !self.streaming_supported {
                report.warning(format!("tool '{}' has a streaming config but streaming is off", self.id));
            }
        }
        if self.read_only && is_mutating_tool_name(&self.id) {
            report.warning(format!(
                "tool '{}' is declared read-only but its name looks mutating; it will not be cached",
                self.id
            ));
        }
        report
    }
}

/// Manifests indexed by tool id. A tool offered by several services has
/// several manifests.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Vec<ToolManifest>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the manifest for `(id, service)`.
    pub fn insert(&mut self, manifest: ToolManifest) {
        let entries = self.tools.entry(manifest.id.clone()).or_default();
        entries.retain(|m| m.service != manifest.service);
        entries.push(manifest);
    }

    /// The manifest of `id` as offered by `service`.
    pub fn get(&self, id: &str, service: &str) -> Option<&ToolManifest> {
        self.tools.get(id)?.iter().find(|m| m.service == service)
    }

    /// Every manifest for `id`.
    pub fn offers(&self, id: &str) -> &[ToolManifest] {
        self.tools.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolManifest> {
        self.tools.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.tools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check every manifest, including that it names a known service.
    pub fn validate(&self, known_services: &HashSet<String>) -> ValidationReport {
        let mut report = ValidationReport::new();
        for manifest in self.iter() {
            report.merge(manifest.validate());
            if !known_services.contains(&manifest.service) {
                report.error(format!(
                    "tool '{}' references unknown service '{}'",
                    manifest.id, manifest.service
                ));
            }
        }
        report
    }
}

impl FromIterator<ToolManifest> for ToolCatalog {
    fn from_iter<I: IntoIterator<Item = ToolManifest>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for manifest in iter {
            catalog.insert(manifest);
        }
        catalog
    }
}
