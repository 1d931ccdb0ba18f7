//! HTTP protocol client.
//!
//! Talks to MCP servers over the streamable-http transport: JSON-RPC 2.0
//! requests POSTed to the server URL, answered either with a JSON body or a
//! short SSE stream. Health is probed with `GET <origin><health_path>`.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::client::{
    ClientConfig, ClientConfiguration, ProbeResult, ProtocolClient, ValidationReport,
};
use super::protocol::{
    last_sse_data, CallToolParams, CallToolResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, MCPInitializeParams,
};
use super::services::ServiceProfile;
use crate::core::{ErrorCategory, McpError};

/// Header carrying the server-assigned session id.
const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC client for one MCP server.
pub struct HttpToolClient {
    profile: ServiceProfile,
    config: ClientConfiguration,
    http: Client,
    request_id: AtomicI64,
    /// Handshake outcome; the inner `None` marks a stateless server
    session: Mutex<Option<Option<String>>>,
}

impl HttpToolClient {
    /// Create a client for `profile`, merging `explicit` settings with
    /// detected and default ones.
    pub fn new(profile: ServiceProfile, explicit: &ClientConfig) -> Result<Self, McpError> {
        let config = ClientConfiguration::resolve(
            explicit,
            || profile.detect_server_url(),
            &profile.default_server_url,
        );

        let http = Client::builder().timeout(config.timeout).build().map_err(|e| {
            McpError::configuration(profile.name.clone(), "failed to build HTTP client")
                .with_details(e.to_string())
        })?;

        Ok(Self { profile, config, http, request_id: AtomicI64::new(1), session: Mutex::new(None) })
    }

    /// The profile this client was built from.
    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    /// URL of the health endpoint.
    pub fn health_url(&self) -> Result<Url, McpError> {
        let base = Url::parse(&self.config.server_url).map_err(|e| {
            McpError::configuration(self.profile.name.clone(), "invalid server URL")
                .with_details(e.to_string())
        })?;
        base.join(&self.profile.health_path).map_err(|e| {
            McpError::configuration(self.profile.name.clone(), "invalid health path")
                .with_details(e.to_string())
        })
    }

    fn next_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the current session, performing the handshake if none is held.
    ///
    /// Servers that do not implement `initialize` are treated as stateless.
    async fn session_id(&self) -> Result<Option<String>, McpError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self.initialize().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Forget `stale` so the next request re-initializes.
    ///
    /// A session already replaced by a concurrent caller is left alone.
    async fn reset_session(&self, stale: &str) {
        let mut slot = self.session.lock().await;
        if matches!(slot.as_ref(), Some(Some(current)) if current == stale) {
            *slot = None;
        }
    }

    async fn initialize(&self) -> Result<Option<String>, McpError> {
        let request = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(MCPInitializeParams::default()).unwrap_or_default()),
        );
        let (response, headers) = self.post(&request, None).await?;

        if let Some(error) = response.error {
            if error.code == -32601 {
                tracing::debug!(service = %self.profile.name, "Server has no initialize; stateless mode");
                return Ok(None);
            }
            return Err(McpError::from_json_rpc(self.profile.name.clone(), error.code, &error.message));
        }

        let session = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);

        let initialized = JsonRpcNotification::new("notifications/initialized");
        if let Err(e) = self.notify(&initialized, session.as_deref()).await {
            tracing::debug!(service = %self.profile.name, error = %e, "initialized notification failed");
        }

        tracing::debug!(service = %self.profile.name, session = ?session, "MCP session established");
        Ok(session)
    }

    fn headers(session: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        if let Some(id) = session.and_then(|s| HeaderValue::from_str(s).ok()) {
            headers.insert(SESSION_HEADER, id);
        }
        headers
    }

    /// POST one JSON-RPC request and decode the response envelope.
    async fn post(
        &self,
        request: &JsonRpcRequest,
        session: Option<&str>,
    ) -> Result<(JsonRpcResponse, HeaderMap), McpError> {
        let service = &self.profile.name;
        let response = self
            .http
            .post(&self.config.server_url)
            .headers(Self::headers(session))
            .json(request)
            .send()
            .await
            .map_err(|e| McpError::from_reqwest(service.clone(), &e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| McpError::from_reqwest(service.clone(), &e))?;

        if !status.is_success() {
            return Err(McpError::from_status(service.clone(), status.as_u16(), &headers, &body));
        }

        let is_sse = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let payload = if is_sse {
            last_sse_data(&body).ok_or_else(|| {
                McpError::new(ErrorCategory::Unknown, service.clone(), "empty event stream")
            })?
        } else {
            body.as_str()
        };

        let envelope: JsonRpcResponse = serde_json::from_str(payload).map_err(|e| {
            McpError::new(ErrorCategory::Unknown, service.clone(), "malformed JSON-RPC response")
                .with_details(e.to_string())
        })?;

        Ok((envelope, headers))
    }

    async fn notify(
        &self,
        notification: &JsonRpcNotification,
        session: Option<&str>,
    ) -> Result<(), McpError> {
        self.http
            .post(&self.config.server_url)
            .headers(Self::headers(session))
            .json(notification)
            .send()
            .await
            .map_err(|e| McpError::from_reqwest(self.profile.name.clone(), &e))?;
        Ok(())
    }

    /// Call a JSON-RPC method and decode its result.
    async fn rpc<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, McpError> {
        let session = self.session_id().await?;
        let request = JsonRpcRequest::new(self.next_id(), method, Some(params.clone()));
        let first = self.post(&request, session.as_deref()).await;
        let response = match (first, session) {
            // Servers answer 404 to a session they no longer know.
            (Err(e), Some(stale)) if e.status_code() == Some(404) => {
                tracing::info!(service = %self.profile.name, "MCP session expired; re-initializing");
                self.reset_session(&stale).await;
                let renewed = self.session_id().await?;
                let request = JsonRpcRequest::new(self.next_id(), method, Some(params));
                self.post(&request, renewed.as_deref()).await?.0
            }
            (result, _) => result?.0,
        };

        response.into_result().map_err(|error| {
            McpError::from_json_rpc(self.profile.name.clone(), error.code, &error.message)
        })
    }
}

#[async_trait]
impl ProtocolClient for HttpToolClient {
    fn service_name(&self) -> &str {
        &self.profile.name
    }

    fn default_server_url(&self) -> &str {
        &self.profile.default_server_url
    }

    fn supported_tools(&self) -> &[String] {
        &self.profile.tools
    }

    fn detect_server_url(&self) -> Option<String> {
        self.profile.detect_server_url()
    }

    fn validate_service_specific(&self) -> ValidationReport {
        self.profile.validate()
    }

    fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value, McpError> {
        let arguments = match args {
            Value::Object(map) => Some(map.clone()),
            Value::Null => Some(Map::new()),
            _ => {
                return Err(McpError::new(
                    ErrorCategory::Validation,
                    self.profile.name.clone(),
                    "tool arguments must be a JSON object",
                )
                .with_tool(name));
            }
        };

        tracing::debug!(service = %self.profile.name, tool = %name, "Calling tool");

        let params = serde_json::to_value(CallToolParams { name: name.to_string(), arguments })
            .unwrap_or_default();
        let result: CallToolResult =
            self.rpc("tools/call", params).await.map_err(|e| e.with_tool(name))?;

        if result.is_error() {
            return Err(McpError::new(
                ErrorCategory::ServerError,
                self.profile.name.clone(),
                "tool reported an error",
            )
            .with_tool(name)
            .with_retryable(false)
            .with_details(result.text()));
        }

        Ok(result.into_value())
    }

    async fn health_check(&self) -> ProbeResult {
        let url = match self.health_url() {
            Ok(url) => url,
            Err(e) => return ProbeResult::unhealthy(e.message().to_string()),
        };

        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = McpError::from_reqwest(self.profile.name.clone(), &e);
                return ProbeResult::unhealthy(error.message().to_string());
            }
        };

        let status = response.status();
        // An auth challenge still proves the service is up.
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return ProbeResult::degraded(format!("reachable but returned {}", status.as_u16()));
        }
        if !status.is_success() {
            return ProbeResult::unhealthy(format!("health endpoint returned {}", status.as_u16()));
        }

        let body: Option<Value> = response.json().await.ok();
        match body.as_ref().and_then(|b| b.get("status")).and_then(Value::as_str) {
            None | Some("healthy" | "ok" | "OK" | "up") => ProbeResult::healthy(),
            Some(other) => ProbeResult::degraded(format!("service reported status '{}'", other)),
        }
    }

    async fn discover_tools(&self) -> Result<Vec<String>, McpError> {
        let result: ListToolsResult = self.rpc("tools/list", Value::Object(Map::new())).await?;
        Ok(result.tools.into_iter().map(|t| t.name).collect())
    }
}
