//! # toolrelay
//!
//! Multi-service tool-protocol client layer.
//!
//! toolrelay puts external tool servers (Google Workspace, Asana, search, ...)
//! behind one MCP client contract, keeps track of which of them are alive,
//! routes and caches tool calls across them, and turns long blocking calls
//! into observable event streams. Every failure is classified into a
//! retry-aware error taxonomy.
//!
//! ## Features
//!
//! - **Service registry**: priority routing, retries with backoff, read-only result cache
//! - **Health monitoring**: concurrent probes, `UNKNOWN → OK → DEGRADED → DOWN`, alerts
//! - **Streaming**: `start`, `progress`, `data`, `end`/`error` events as SSE frames
//! - **Typed errors**: ten categories, rate-limit aware retry delays
//!
//! ## Quick Start
//!
//! ```bash
//! # Show service health
//! toolrelay status
//!
//! # Call a tool
//! toolrelay call search_drive_files --args '{"query": "budget"}'
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::redundant_clone)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::use_self)]

pub mod core;
pub mod mcp;

// Re-export commonly used types
pub use core::{Config, ErrorCategory, McpError, McpResult, RetryPolicy};
pub use mcp::{
    ExecuteOptions, HealthState, HttpToolClient, ProtocolClient, ServiceProfile, ServiceRegistry,
    StreamEvent, StreamingRequest, StreamingWrapper, ToolManifest,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "toolrelay";
