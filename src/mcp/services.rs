//! Service profiles.
//!
//! A profile describes what a tool service looks like from the outside:
//! its name, where it usually runs, how to find it in the environment and
//! which tools it is expected to offer. Profiles are plain data; the HTTP
//! client turns one into a working [`ProtocolClient`](super::ProtocolClient).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::client::ValidationReport;

/// Static description of a tool service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Unique service name (lowercase, `[a-z0-9_-]`)
    pub name: String,
    /// Endpoint used when nothing else is configured
    pub default_server_url: String,
    /// Environment variable consulted by auto-detection
    pub url_env_var: String,
    /// Path of the health endpoint, relative to the server origin
    pub health_path: String,
    /// Tools the service is expected to offer
    #[serde(default)]
    pub tools: Vec<String>,
    /// Environment variables that must be set for the service to work
    #[serde(default)]
    pub required_env: Vec<String>,
}

impl ServiceProfile {
    /// Create a profile with the conventional env var and health path.
    pub fn new(name: impl Into<String>, default_server_url: impl Into<String>) -> Self {
        let name = name.into();
        let url_env_var = format!("{}_MCP_URL", name.to_uppercase().replace('-', "_"));
        Self {
            name,
            default_server_url: default_server_url.into(),
            url_env_var,
            health_path: "/health".to_string(),
            tools: Vec::new(),
            required_env: Vec::new(),
        }
    }

    /// Set the expected tools.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Set the health endpoint path.
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Require an environment variable.
    pub fn requires_env(mut self, var: impl Into<String>) -> Self {
        self.required_env.push(var.into());
        self
    }

    /// Google Workspace tool server (Drive, Docs, Sheets, Chat, Forms, Slides).
    pub fn google_workspace() -> Self {
        Self::new("google_workspace", "http://localhost:8000/mcp").with_tools([
            "start_google_auth",
            "search_drive_files",
            "list_drive_items",
            "get_drive_file_content",
            "create_drive_file",
            "search_docs",
            "list_docs_in_folder",
            "create_doc",
            "read_doc_comments",
            "create_doc_comment",
            "reply_to_comment",
            "resolve_comment",
            "list_spreadsheets",
            "get_spreadsheet_info",
            "read_sheet_values",
            "modify_sheet_values",
            "create_spreadsheet",
            "create_sheet",
            "list_spaces",
            "get_messages",
            "search_messages",
            "send_message",
            "create_form",
            "get_form",
            "set_publish_settings",
            "get_form_response",
            "list_form_responses",
            "create_presentation",
            "get_presentation",
            "batch_update_presentation",
            "get_page",
            "get_page_thumbnail",
        ])
    }

    /// Asana tool server.
    pub fn asana() -> Self {
        Self::new("asana", "http://localhost:3001/mcp")
            .with_tools([
                "asana_list_workspaces",
                "asana_search_projects",
                "asana_get_project",
                "asana_search_tasks",
                "asana_get_task",
                "asana_get_task_stories",
                "asana_create_task",
                "asana_update_task",
                "asana_create_task_story",
            ])
            .requires_env("ASANA_ACCESS_TOKEN")
    }

    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "google_workspace" => Some(Self::google_workspace()),
            "asana" => Some(Self::asana()),
            _ => None,
        }
    }

    /// Read the server URL from the environment, if set.
    pub fn detect_server_url(&self) -> Option<String> {
        std::env::var(&self.url_env_var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    /// Checks specific to this profile.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();

        if self.name.is_empty()
            || !self.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            report.error(format!("invalid service name '{}'", self.name));
        }

        if !self.health_path.starts_with('/') {
            report.error(format!("health path '{}' must start with '/'", self.health_path));
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.as_str()) {
                report.error(format!("tool '{}' is listed twice", tool));
            }
        }

        if self.tools.is_empty() {
            report.warning("no tools declared; relying on discovery");
        }

        for var in &self.required_env {
            if std::env::var(var).map_or(true, |v| v.trim().is_empty()) {
                report.error(format!("environment variable {} is not set", var));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_env_var_naming() {
        let profile = ServiceProfile::new("web-search", "http://localhost:9000/mcp");
        assert_eq!(profile.url_env_var, "WEB_SEARCH_MCP_URL");
        assert_eq!(profile.health_path, "/health");
    }

    #[test]
    fn test_builtin_profiles() {
        let workspace = ServiceProfile::builtin("google_workspace").unwrap();
        assert!(workspace.tools.iter().any(|t| t == "search_drive_files"));
        assert!(workspace.validate().is_valid());

        assert!(ServiceProfile::builtin("asana").is_some());
        assert!(ServiceProfile::builtin("nope").is_none());
    }

    #[test]
    fn test_duplicate_tools_rejected() {
        let profile = ServiceProfile::new("dup", "http://localhost:1/mcp").with_tools(["a", "a"]);
        let report = profile.validate();
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("twice"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let profile = ServiceProfile::new("Bad Name", "http://localhost:1/mcp").with_tools(["a"]);
        assert!(!profile.validate().is_valid());
    }

    #[test]
    #[serial]
    fn test_detect_server_url_from_env() {
        let profile = ServiceProfile::new("detecttest", "http://localhost:1/mcp");
        std::env::set_var("DETECTTEST_MCP_URL", "http://10.0.0.5:8080/mcp");
        assert_eq!(profile.detect_server_url().as_deref(), Some("http://10.0.0.5:8080/mcp"));

        std::env::set_var("DETECTTEST_MCP_URL", "  ");
        assert_eq!(profile.detect_server_url(), None);

        std::env::remove_var("DETECTTEST_MCP_URL");
        assert_eq!(profile.detect_server_url(), None);
    }

    #[test]
    #[serial]
    fn test_required_env_checked() {
        let profile = ServiceProfile::new("needs-token", "http://localhost:1/mcp")
            .with_tools(["x"])
            .requires_env("NEEDS_TOKEN_TEST_VAR");

        std::env::remove_var("NEEDS_TOKEN_TEST_VAR");
        assert!(!profile.validate().is_valid());

        std::env::set_var("NEEDS_TOKEN_TEST_VAR", "secret");
        assert!(profile.validate().is_valid());
        std::env::remove_var("NEEDS_TOKEN_TEST_VAR");
    }
}
