//! Core types shared by every tool service.
//!
//! This module contains the error taxonomy, the retry strategy and the
//! application configuration.

mod config;
mod error;
mod retry;

pub use config::{Config, RegistryConfig, ServiceEntry};
pub use error::{ErrorCategory, ErrorContext, McpError, McpResult, RateLimitInfo};
pub use retry::{retry_async, should_retry, RetryPolicy, RetryResult};
