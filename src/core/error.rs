//! Error taxonomy for tool calls.
//!
//! Every failure that crosses the protocol-client boundary is normalized into
//! an [`McpError`] with one of ten categories. Callers branch on
//! [`McpError::category`] and [`McpError::is_retryable`] instead of matching
//! on messages.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Maximum number of bytes of a raw response body kept in error details.
const MAX_DETAIL_BYTES: usize = 512;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Connection refused, DNS failure, reset sockets
    Network,
    /// Missing or rejected credentials (HTTP 401)
    Authentication,
    /// Credentials valid but not permitted (HTTP 403)
    Authorization,
    /// Malformed request or arguments (HTTP 400)
    Validation,
    /// Too many requests (HTTP 429)
    RateLimit,
    /// Server-side failure (HTTP 5xx)
    ServerError,
    /// Any other client-side rejection (HTTP 4xx)
    ClientError,
    /// The call did not complete in time
    Timeout,
    /// Local misconfiguration; retrying cannot help
    Configuration,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorCategory {
    /// All categories, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Network,
        Self::Authentication,
        Self::Authorization,
        Self::Validation,
        Self::RateLimit,
        Self::ServerError,
        Self::ClientError,
        Self::Timeout,
        Self::Configuration,
        Self::Unknown,
    ];

    /// Canonical wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Authentication => "AUTHENTICATION",
            Self::Authorization => "AUTHORIZATION",
            Self::Validation => "VALIDATION",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::ClientError => "CLIENT_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Configuration => "CONFIGURATION",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Default retryability for errors of this category.
    pub const fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError)
    }

    /// Map an HTTP status code to a category.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            429 => Self::RateLimit,
            500..=599 => Self::ServerError,
            402..=499 => Self::ClientError,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and when an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    /// Service the call was routed to
    pub service: String,
    /// Tool being executed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// When the error was constructed
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt number, when the call was retried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
}

/// Rate limit hints parsed from response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// How long the server asked us to wait
    pub retry_after: Option<Duration>,
    /// Requests left in the current window
    pub remaining: Option<u64>,
    /// Window size advertised by the server
    pub limit: Option<u64>,
}

impl RateLimitInfo {
    /// Parse `Retry-After` and the `X-RateLimit-*` family of headers.
    ///
    /// `Retry-After` may be delta-seconds or an HTTP date. When it is absent,
    /// `X-RateLimit-Reset` (epoch seconds) is used to derive the wait.
    pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

        let mut retry_after = header("retry-after").and_then(|value| {
            if let Ok(secs) = value.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            DateTime::parse_from_rfc2822(value).ok().map(|at| {
                let delta = at.with_timezone(&Utc) - now;
                delta.to_std().unwrap_or(Duration::ZERO)
            })
        });

        if retry_after.is_none() {
            retry_after = header("x-ratelimit-reset")
                .and_then(|value| value.parse::<i64>().ok())
                .and_then(|reset| DateTime::<Utc>::from_timestamp(reset, 0))
                .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        }

        Self {
            retry_after,
            remaining: header("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            limit: header("x-ratelimit-limit").and_then(|v| v.parse().ok()),
        }
    }
}

/// A normalized tool-call failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{category} error from {}: {message}", context.service)]
pub struct McpError {
    category: ErrorCategory,
    message: String,
    context: ErrorContext,
    retryable: bool,
    status_code: Option<u16>,
    retry_after: Option<Duration>,
    details: Option<String>,
    exhausted: bool,
}

impl McpError {
    /// Create an error with the category's default retryability.
    pub fn new(
        category: ErrorCategory,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            context: ErrorContext {
                service: service.into(),
                tool: None,
                timestamp: Utc::now(),
                attempt_number: None,
            },
            retryable: category.is_retryable_by_default(),
            status_code: None,
            retry_after: None,
            details: None,
            exhausted: false,
        }
    }

    /// Attach the tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.context.tool = Some(tool.into());
        self
    }

    /// Record the attempt number this error belongs to.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.context.attempt_number = Some(attempt);
        self
    }

    /// Attach the HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Attach a server-provided wait hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Override the default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach diagnostic details (truncated raw bodies and the like).
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(truncate(details.into(), MAX_DETAIL_BYTES));
        self
    }

    /// Error category.
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Human-readable message (never contains raw response bodies).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Service/tool/attempt context.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Service that produced the error.
    pub fn service(&self) -> &str {
        &self.context.service
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// HTTP status code, if the failure came from an HTTP response.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Server-provided wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Diagnostic details for logs.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Whether this error is the result of an exhausted retry budget.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(
        service: impl Into<String>,
        status: u16,
        headers: &HeaderMap,
        body: &str,
    ) -> Self {
        let category = ErrorCategory::from_status(status);
        let message = match category {
            ErrorCategory::Authentication => "authentication required".to_string(),
            ErrorCategory::Authorization => "access to this resource is forbidden".to_string(),
            ErrorCategory::Validation => "request was rejected as invalid".to_string(),
            ErrorCategory::RateLimit => "rate limit exceeded".to_string(),
            ErrorCategory::ServerError => format!("server responded with status {}", status),
            _ => format!("unexpected response status {}", status),
        };

        let mut error = Self::new(category, service, message).with_status(status);
        if category == ErrorCategory::RateLimit {
            let limits = RateLimitInfo::from_headers(headers, Utc::now());
            if let Some(wait) = limits.retry_after {
                error = error.with_retry_after(wait);
            }
        }
        if !body.trim().is_empty() {
            error = error.with_details(body.trim().to_string());
        }
        error
    }

    /// Build an error from a transport failure.
    pub fn from_reqwest(service: impl Into<String>, err: &reqwest::Error) -> Self {
        let service = service.into();
        if err.is_timeout() {
            return Self::new(ErrorCategory::Timeout, service, "request timed out");
        }
        if let Some(status) = err.status() {
            return Self::from_status(service, status.as_u16(), &HeaderMap::new(), "");
        }
        if err.is_builder() {
            return Self::new(ErrorCategory::Configuration, service, "invalid request")
                .with_details(err.to_string());
        }
        if err.is_connect() || err.is_request() {
            return Self::new(ErrorCategory::Network, service, "could not reach service")
                .with_details(err.to_string());
        }
        if err.is_decode() || err.is_body() {
            return Self::new(ErrorCategory::Unknown, service, "malformed response body")
                .with_details(err.to_string());
        }
        Self::new(ErrorCategory::Unknown, service, "request failed").with_details(err.to_string())
    }

    /// Build an error from a JSON-RPC error object.
    pub fn from_json_rpc(service: impl Into<String>, code: i32, message: &str) -> Self {
        let category = match code {
            -32602 | -32700 | -32600 => ErrorCategory::Validation,
            -32601 => ErrorCategory::ClientError,
            -32603 => ErrorCategory::ServerError,
            -32099..=-32000 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        };
        Self::new(category, service, format!("tool server error {}", code))
            .with_details(message.to_string())
    }

    /// A per-call timeout elapsed.
    pub fn timeout(service: impl Into<String>, after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            service,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// No service offers the requested tool.
    pub fn tool_not_found(tool: &str) -> Self {
        Self::new(ErrorCategory::Configuration, "registry", format!("tool not found: {}", tool))
            .with_tool(tool)
            .with_retryable(false)
    }

    /// The owning service is disabled or down.
    pub fn service_not_available(service: impl Into<String>, tool: &str) -> Self {
        Self::new(ErrorCategory::Configuration, service, "service not available")
            .with_tool(tool)
            .with_retryable(false)
    }

    /// The registry has been torn down.
    pub fn destroyed() -> Self {
        Self::new(ErrorCategory::Configuration, "registry", "registry has been destroyed")
            .with_retryable(false)
    }

    /// Invalid local configuration.
    pub fn configuration(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, service, message)
    }

    /// Wrap the last retryable failure once the attempt budget is spent.
    ///
    /// The category of the last failure is kept so callers can still branch
    /// on it; the error itself is no longer retryable.
    pub fn retries_exhausted(last: Self, attempts: u32) -> Self {
        let mut error = Self::new(
            last.category,
            last.context.service.clone(),
            format!("service unavailable after {} attempts: {}", attempts, last.message),
        )
        .with_retryable(false)
        .with_attempt(attempts);
        error.context.tool = last.context.tool;
        error.status_code = last.status_code;
        error.details = last.details;
        error.exhausted = true;
        error
    }

    /// Message safe to show to end users.
    pub fn user_message(&self) -> String {
        let service = &self.context.service;
        if self.exhausted {
            return format!("The {} service is currently unavailable. Please try again later.", service);
        }
        match self.category {
            ErrorCategory::Authentication => {
                format!("Authentication with {} failed. Please reconnect the account.", service)
            }
            ErrorCategory::Authorization => {
                format!("You do not have permission to perform this action in {}.", service)
            }
            ErrorCategory::Validation => {
                "The request was invalid. Please check the provided details.".to_string()
            }
            ErrorCategory::RateLimit => {
                format!("{} is receiving too many requests. Please wait a moment.", service)
            }
            ErrorCategory::Configuration => self.message.clone(),
            ErrorCategory::Network
            | ErrorCategory::ServerError
            | ErrorCategory::Timeout
            | ErrorCategory::ClientError
            | ErrorCategory::Unknown => {
                format!("The {} service is currently unavailable. Please try again later.", service)
            }
        }
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("...");
    text
}

/// Result type for tool-call operations.
pub type McpResult<T> = Result<T, McpError>;
