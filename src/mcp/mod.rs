//! MCP (Model Context Protocol) client layer.
//!
//! Wraps heterogeneous tool servers behind one client contract, tracks
//! their health, routes and caches tool calls, and streams long calls as
//! events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                StreamingWrapper                  │
//! │     start → progress/status/data → end|error     │
//! └──────────────────────────────────────────────────┘
//!                         │
//! ┌──────────────────────────────────────────────────┐
//! │                 ServiceRegistry                  │
//! │  • Routes tools by priority                      │
//! │  • Retries with backoff, caches read-only calls  │
//! │  • HealthMonitor: UNKNOWN → OK → DEGRADED → DOWN │
//! └──────────────────────────────────────────────────┘
//!          │                │                │
//!          ▼                ▼                ▼
//!   ProtocolClient   ProtocolClient   ProtocolClient
//!  (google_workspace)    (asana)         (custom)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toolrelay::mcp::{HttpToolClient, ServiceProfile, ServiceRegistry, ClientConfig};
//!
//! let client = HttpToolClient::new(ServiceProfile::google_workspace(), &ClientConfig::default())?;
//! let registry = ServiceRegistry::builder().register(client).build()?;
//!
//! registry.start_health_monitoring()?;
//! let files = registry.execute_tool("search_drive_files", &json!({"query": "budget"})).await?;
//! registry.destroy();
//! ```

mod cache;
mod client;
mod health;
mod http;
mod manifest;
mod protocol;
mod registry;
mod services;
mod streaming;

pub use cache::{canonical_json, CacheEntry, CacheKey, CachePolicy, CacheStats, ResultCache};
pub use client::{
    validate_generic, ClientConfig, ClientConfiguration, ProbeResult, ProbeStatus,
    ProtocolClient, ValidationReport, DEFAULT_RETRIES, DEFAULT_TIMEOUT,
};
pub use health::{
    next_status, AlertKind, HealthAlert, HealthMonitor, HealthPolicy, HealthState, HealthStatus,
    ProbeOutcome,
};
pub use http::HttpToolClient;
pub use manifest::{
    is_mutating_tool_name, StreamingConfig, StreamingMode, ToolCatalog, ToolManifest,
};
pub use protocol::{
    last_sse_data, CallToolParams, CallToolResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, MCPClientInfo, MCPInitializeParams, MCPTool,
    RequestId, ToolContent, PROTOCOL_VERSION,
};
pub use registry::{
    ExecuteOptions, RegistryBuilder, RegistryError, ResolvedTool, ServiceDescriptor,
    ServiceRegistry, ServiceSettings,
};
pub use services::ServiceProfile;
pub use streaming::{
    ChunkInfo, DataPayload, EndPayload, ProgressPayload, StartPayload, StatusPayload,
    StreamErrorInfo, StreamEvent, StreamEventKind, StreamingOptions, StreamingRequest,
    StreamingResponse, StreamingSettings, StreamingWrapper, ToolEventStream,
};
