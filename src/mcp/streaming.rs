//! Streaming wrapper.
//!
//! Turns one tool call into an ordered stream of events: a single `start`,
//! any number of `progress`, `status` and `data` events, then exactly one
//! `end` or `error`. For most tools the call itself is blocking, so
//! progress is synthesized from the manifest's steps while the call runs in
//! a background task. Dropping the stream aborts that task.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::manifest::{StreamingConfig, StreamingMode};
use super::registry::{ExecuteOptions, ResolvedTool, ServiceRegistry};
use crate::core::{ErrorCategory, McpError};

/// Per-request streaming switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingOptions {
    /// Emit synthesized progress events
    pub enable_progress: bool,
    /// Split array results into several data events when the tool allows it
    #[serde(alias = "enablePartialResults")]
    pub enable_incremental_data: bool,
    /// Emit status events
    pub enable_status_updates: bool,
    /// Override the manifest's chunk size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    /// Override the progress cadence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_interval_ms: Option<u64>,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            enable_progress: true,
            enable_incremental_data: true,
            enable_status_updates: true,
            chunk_size: None,
            progress_interval_ms: None,
        }
    }
}

/// A request to run a tool as a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_options: Option<StreamingOptions>,
}

impl StreamingRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self { tool_name: tool_name.into(), arguments, streaming_options: None }
    }

    pub fn with_options(mut self, options: StreamingOptions) -> Self {
        self.streaming_options = Some(options);
        self
    }
}

/// Wrapper-wide streaming settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Default cadence of synthesized progress
    pub tick_interval_ms: u64,
    /// Events buffered before the producer waits for the consumer
    pub channel_capacity: usize,
    /// Allow chunked data events at all
    pub incremental_data: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self { tick_interval_ms: 500, channel_capacity: 32, incremental_data: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub service: String,
    pub mode: StreamingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// 1-based step number
    pub step: usize,
    pub total_steps: usize,
    pub message: String,
    /// Never reaches 100 before the result is in
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    /// Set on output forwarded from a natively streaming service
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub duration_ms: u64,
    pub data_events: usize,
}

/// Failure reported as the terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorInfo {
    /// User-facing message
    pub message: String,
    /// Whether trying again later may succeed
    pub recoverable: bool,
    pub category: ErrorCategory,
}

/// Event body, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEventKind {
    Start { payload: StartPayload },
    Progress { payload: ProgressPayload },
    Status { payload: StatusPayload },
    Data { payload: DataPayload },
    Error { error: StreamErrorInfo },
    End { payload: EndPayload },
}

/// One event of a tool stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(flatten)]
    pub kind: StreamEventKind,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub request_id: String,
}

impl StreamEvent {
    /// Whether this event closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StreamEventKind::End { .. } | StreamEventKind::Error { .. })
    }

    /// The event's `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            StreamEventKind::Start { .. } => "start",
            StreamEventKind::Progress { .. } => "progress",
            StreamEventKind::Status { .. } => "status",
            StreamEventKind::Data { .. } => "data",
            StreamEventKind::Error { .. } => "error",
            StreamEventKind::End { .. } => "end",
        }
    }

    /// Render as a server-sent events frame.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Events of one streamed tool call.
///
/// Dropping the stream aborts the producer and the in-flight call.
pub struct ToolEventStream {
    events: mpsc::Receiver<StreamEvent>,
    producer: JoinHandle<()>,
}

impl Stream for ToolEventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for ToolEventStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl std::fmt::Debug for ToolEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEventStream").field("finished", &self.producer.is_finished()).finish()
    }
}

/// Handle returned by [`StreamingWrapper::execute_streaming`].
#[derive(Debug)]
pub struct StreamingResponse {
    pub request_id: String,
    pub stream: ToolEventStream,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Decrements the active stream count when the producer ends or is aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs tools through the registry as event streams.
#[derive(Debug, Clone)]
pub struct StreamingWrapper {
    registry: ServiceRegistry,
    settings: StreamingSettings,
    active: Arc<AtomicUsize>,
}

impl StreamingWrapper {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self::with_settings(registry, StreamingSettings::default())
    }

    pub fn with_settings(registry: ServiceRegistry, settings: StreamingSettings) -> Self {
        Self { registry, settings, active: Arc::new(AtomicUsize::new(0)) }
    }

    /// Number of producers still running.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Validate `request` and start streaming it.
    ///
    /// Invalid requests are rejected here, before any stream exists; every
    /// failure after this point arrives as a terminal `error` event.
    pub fn execute_streaming(&self, request: StreamingRequest) -> Result<StreamingResponse, McpError> {
        let tool_name = request.tool_name.trim().to_string();
        if tool_name.is_empty() {
            return Err(McpError::new(ErrorCategory::Validation, "streaming", "tool name is required"));
        }

        let arguments = match request.arguments {
            Value::Null => Value::Object(Map::new()),
            args @ Value::Object(_) => args,
            _ => {
                return Err(McpError::new(
                    ErrorCategory::Validation,
                    "streaming",
                    "tool arguments must be a JSON object",
                )
                .with_tool(tool_name));
            }
        };

        let resolved = self.registry.resolve_tool(&tool_name, false)?;
        let Some(config) = resolved.manifest.effective_streaming_config() else {
            return Err(McpError::new(
                ErrorCategory::Validation,
                resolved.manifest.service.clone(),
                "tool does not support streaming",
            )
            .with_tool(tool_name)
            .with_retryable(false));
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            McpError::configuration("streaming", "streaming needs a tokio runtime")
        })?;

        let request_id = Uuid::new_v4().to_string();
        let options = request.streaming_options.unwrap_or_default();
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));

        self.active.fetch_add(1, Ordering::AcqRel);
        let producer = Producer {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            resolved,
            config,
            options,
            tool_name: tool_name.clone(),
            arguments,
            request_id: request_id.clone(),
            tx,
            data_events: 0,
        };
        let guard = ActiveGuard(Arc::clone(&self.active));
        let handle = runtime.spawn(async move {
            let _guard = guard;
            producer.run().await;
        });

        tracing::debug!(tool = %tool_name, request_id = %request_id, "Started tool stream");
        Ok(StreamingResponse { request_id, stream: ToolEventStream { events: rx, producer: handle } })
    }
}

/// Receiver went away; stop producing.
struct Closed;

struct Producer {
    registry: ServiceRegistry,
    settings: StreamingSettings,
    resolved: ResolvedTool,
    config: StreamingConfig,
    options: StreamingOptions,
    tool_name: String,
    arguments: Value,
    request_id: String,
    tx: mpsc::Sender<StreamEvent>,
    data_events: usize,
}

impl Producer {
    async fn run(mut self) {
        let started = Instant::now();
        let native = self.config.mode == StreamingMode::Native
            && self.resolved.client.supports_native_streaming();

        let outcome = self.drive(native).await;
        let Ok(result) = outcome else {
            tracing::debug!(tool = %self.tool_name, request_id = %self.request_id, "Stream dropped by consumer");
            return;
        };

        let terminal = match result {
            Ok(value) => match self.emit_result(value, native).await {
                Ok(()) => StreamEventKind::End {
                    payload: EndPayload {
                        duration_ms: started.elapsed().as_millis() as u64,
                        data_events: self.data_events,
                    },
                },
                Err(Closed) => return,
            },
            Err(e) => {
                tracing::debug!(tool = %self.tool_name, error = %e, "Streamed tool call failed");
                StreamEventKind::Error {
                    error: StreamErrorInfo {
                        message: e.user_message(),
                        recoverable: e.is_retryable() || e.is_exhausted(),
                        category: e.category(),
                    },
                }
            }
        };
        let _ = self.send(terminal).await;
    }

    /// Emit the prelude and progress, and wait for the call to finish.
    async fn drive(&mut self, native: bool) -> Result<Result<Value, McpError>, Closed> {
        let manifest = &self.resolved.manifest;
        let mode = if native { StreamingMode::Native } else { StreamingMode::Synthetic };
        self.send(StreamEventKind::Start {
            payload: StartPayload {
                service: manifest.service.clone(),
                mode,
                estimated_duration_ms: manifest.estimated_duration_ms,
            },
        })
        .await?;

        if self.config.mode == StreamingMode::Native && !native && self.options.enable_status_updates {
            self.send(StreamEventKind::Status {
                payload: StatusPayload {
                    message: "native streaming unavailable; reporting synthesized progress".to_string(),
                },
            })
            .await?;
        }

        let (partial_tx, mut partial_rx) = mpsc::unbounded_channel();
        let mut call = AbortOnDrop(self.spawn_call(native, partial_tx));

        let steps = self.config.progress_steps.clone();
        let synthesize = !native && self.options.enable_progress && !steps.is_empty();
        let mut ticker = tokio::time::interval(self.tick_interval(steps.len()));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut step = 0;

        let joined = loop {
            tokio::select! {
                biased;
                () = self.tx.closed() => return Err(Closed),
                joined = &mut call.0 => break joined,
                Some(partial) = partial_rx.recv(), if native => {
                    self.send_data(partial, None, true).await?;
                }
                _ = ticker.tick(), if synthesize && step < steps.len() => {
                    step += 1;
                    self.send(StreamEventKind::Progress {
                        payload: ProgressPayload {
                            step,
                            total_steps: steps.len(),
                            message: steps[step - 1].clone(),
                            percent: (step * 100 / (steps.len() + 1)) as u8,
                        },
                    })
                    .await?;
                }
            }
        };

        while let Ok(partial) = partial_rx.try_recv() {
            self.send_data(partial, None, true).await?;
        }

        Ok(joined.unwrap_or_else(|e| {
            Err(McpError::new(
                ErrorCategory::Unknown,
                self.resolved.manifest.service.clone(),
                "tool execution was interrupted",
            )
            .with_tool(self.tool_name.clone())
            .with_details(e.to_string())
            .with_retryable(false))
        }))
    }

    fn spawn_call(
        &self,
        native: bool,
        partial: mpsc::UnboundedSender<Value>,
    ) -> JoinHandle<Result<Value, McpError>> {
        let name = self.tool_name.clone();
        let args = self.arguments.clone();

        if native {
            // Partial output cannot be replayed, so native calls get one attempt.
            let client = Arc::clone(&self.resolved.client);
            let timeout = client.configuration().timeout;
            let service = self.resolved.manifest.service.clone();
            return tokio::spawn(async move {
                match tokio::time::timeout(timeout, client.execute_tool_streaming(&name, &args, partial)).await {
                    Ok(result) => result.map_err(|e| e.with_tool(name)),
                    Err(_) => Err(McpError::timeout(service, timeout).with_tool(name)),
                }
            });
        }

        let registry = self.registry.clone();
        let resolved = self.resolved.clone();
        tokio::spawn(async move {
            registry.execute_resolved(resolved, &name, &args, ExecuteOptions::default()).await
        })
    }

    fn tick_interval(&self, steps: usize) -> Duration {
        let ms = self
            .options
            .progress_interval_ms
            .or_else(|| {
                self.resolved.manifest.estimated_duration_ms.map(|d| d / (steps as u64 + 1))
            })
            .unwrap_or(self.settings.tick_interval_ms);
        Duration::from_millis(ms.max(10))
    }

    async fn emit_result(&mut self, value: Value, native: bool) -> Result<(), Closed> {
        let chunk_size = self.options.chunk_size.or(self.config.chunk_size).filter(|&n| n > 0);
        let chunked = !native
            && self.config.supports_partial_results
            && self.options.enable_incremental_data
            && self.settings.incremental_data;

        match (value, chunk_size) {
            (Value::Array(items), Some(size)) if chunked && items.len() > size => {
                let total = items.len().div_ceil(size);
                for (index, chunk) in items.chunks(size).enumerate() {
                    self.send_data(Value::Array(chunk.to_vec()), Some(ChunkInfo { index, total }), false)
                        .await?;
                }
                Ok(())
            }
            (value, _) => self.send_data(value, None, false).await,
        }
    }

    async fn send_data(
        &mut self,
        data: Value,
        chunk: Option<ChunkInfo>,
        partial: bool,
    ) -> Result<(), Closed> {
        self.data_events += 1;
        self.send(StreamEventKind::Data { payload: DataPayload { data, chunk, partial } }).await
    }

    async fn send(&self, kind: StreamEventKind) -> Result<(), Closed> {
        let event = StreamEvent {
            kind,
            timestamp: Utc::now(),
            tool_name: self.tool_name.clone(),
            request_id: self.request_id.clone(),
        };
        self.tx.send(event).await.map_err(|_| Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: StreamEventKind) -> StreamEvent {
        StreamEvent {
            kind,
            timestamp: Utc::now(),
            tool_name: "search_docs".to_string(),
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let data = event(StreamEventKind::Data {
            payload: DataPayload { data: json!([1]), chunk: None, partial: false },
        });
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["toolName"], "search_docs");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["payload"]["data"], json!([1]));
        assert!(json["payload"].get("partial").is_none());
    }

    #[test]
    fn test_error_event_wire_format() {
        let error = event(StreamEventKind::Error {
            error: StreamErrorInfo {
                message: "unavailable".to_string(),
                recoverable: true,
                category: ErrorCategory::Network,
            },
        });
        assert!(error.is_terminal());
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["recoverable"], true);
        assert_eq!(json["error"]["category"], "NETWORK");
    }

    #[test]
    fn test_sse_frame() {
        let end = event(StreamEventKind::End { payload: EndPayload { duration_ms: 5, data_events: 1 } });
        let frame = end.to_sse_frame().unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert_eq!(end.event_type(), "end");

        let parsed: StreamEvent =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(parsed, end);
    }

    #[tokio::test]
    async fn test_event_stream_wakes_on_send() {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(std::future::pending::<()>());
        let mut stream = tokio_test::task::spawn(ToolEventStream { events: rx, producer });

        tokio_test::assert_pending!(stream.poll_next());
        tx.send(event(StreamEventKind::Status { payload: StatusPayload { message: "x".into() } }))
            .await
            .unwrap();
        assert!(stream.is_woken());

        let next = tokio_test::assert_ready!(stream.poll_next()).unwrap();
        assert_eq!(next.event_type(), "status");

        drop(tx);
        assert!(tokio_test::assert_ready!(stream.poll_next()).is_none());
    }

    #[tokio::test]
    async fn test_dropping_event_stream_aborts_producer() {
        let (_tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(std::future::pending::<()>());
        let probe = producer.abort_handle();

        drop(ToolEventStream { events: rx, producer });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(probe.is_finished());
    }

    #[test]
    fn test_request_accepts_camel_case() {
        let request: StreamingRequest = serde_json::from_str(
            r#"{"toolName":"search_docs","arguments":{"q":"x"},"streamingOptions":{"enableProgress":false}}"#,
        )
        .unwrap();
        assert_eq!(request.tool_name, "search_docs");
        let options = request.streaming_options.unwrap();
        assert!(!options.enable_progress);
        assert!(options.enable_incremental_data);
        assert!(options.enable_status_updates);
        assert_eq!(options.chunk_size, None);
    }
}
