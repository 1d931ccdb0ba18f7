//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use toolrelay::core::{ErrorCategory, McpError, RetryPolicy};
use toolrelay::mcp::{
    ClientConfig, ClientConfiguration, ProbeResult, ProtocolClient, RegistryBuilder,
    ServiceRegistry, ServiceSettings, ValidationReport,
};

/// Scripted protocol client.
pub struct MockClient {
    name: String,
    tools: Vec<String>,
    config: ClientConfiguration,
    calls: AtomicUsize,
    probes: AtomicUsize,
    responses: Mutex<VecDeque<Result<Value, McpError>>>,
    health: Mutex<ProbeResult>,
    call_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    native_chunks: Option<Vec<Value>>,
}

impl MockClient {
    pub fn new(name: &str, tools: &[&str]) -> Self {
        Self::with_config(name, tools, ClientConfig { retries: Some(2), ..Default::default() })
    }

    pub fn with_config(name: &str, tools: &[&str], config: ClientConfig) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            config: ClientConfiguration::resolve(&config, || None, "http://localhost:1/mcp"),
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
            health: Mutex::new(ProbeResult::healthy()),
            call_delay: Mutex::new(Duration::ZERO),
            probe_delay: Mutex::new(Duration::ZERO),
            native_chunks: None,
        }
    }

    /// Report native streaming and emit `chunks` before the result.
    pub fn native(mut self, chunks: Vec<Value>) -> Self {
        self.native_chunks = Some(chunks);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Queue responses; once drained, calls succeed with a default value.
    pub fn respond(&self, response: Result<Value, McpError>) {
        self.responses.lock().push_back(response);
    }

    pub fn fail_with(&self, category: ErrorCategory, times: usize) {
        for _ in 0..times {
            self.respond(Err(McpError::new(category, self.name.clone(), "scripted failure")));
        }
    }

    pub fn set_health(&self, probe: ProbeResult) {
        *self.health.lock() = probe;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn default_server_url(&self) -> &str {
        "http://localhost:1/mcp"
    }

    fn supported_tools(&self) -> &[String] {
        &self.tools
    }

    fn detect_server_url(&self) -> Option<String> {
        None
    }

    fn validate_service_specific(&self) -> ValidationReport {
        ValidationReport::new()
    }

    fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.call_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.responses.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "service": self.name, "tool": name, "args": args })))
    }

    async fn health_check(&self) -> ProbeResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.health.lock().clone()
    }

    fn supports_native_streaming(&self) -> bool {
        self.native_chunks.is_some()
    }

    async fn execute_tool_streaming(
        &self,
        name: &str,
        args: &Value,
        partial: mpsc::UnboundedSender<Value>,
    ) -> Result<Value, McpError> {
        for chunk in self.native_chunks.iter().flatten() {
            let _ = partial.send(chunk.clone());
        }
        self.execute_tool(name, args).await
    }
}

/// Builder with instant retries, ready for mocks.
pub fn builder() -> RegistryBuilder {
    ServiceRegistry::builder().retry_policy(RetryPolicy::immediate())
}

pub fn register(builder: RegistryBuilder, client: &Arc<MockClient>) -> RegistryBuilder {
    register_with(builder, client, ServiceSettings::default())
}

pub fn register_with(
    builder: RegistryBuilder,
    client: &Arc<MockClient>,
    settings: ServiceSettings,
) -> RegistryBuilder {
    let client: Arc<dyn ProtocolClient> = Arc::clone(client) as Arc<dyn ProtocolClient>;
    builder.register_with(client, settings)
}
