//! Streaming Wrapper Integration Tests
//!
//! Event ordering, chunking, native partial output and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use common::{builder, register, MockClient};
use toolrelay::core::ErrorCategory;
use toolrelay::mcp::{
    HealthPolicy, HealthState, ProbeResult, ServiceRegistry, StreamEvent, StreamEventKind, StreamingConfig, StreamingMode,
    StreamingOptions, StreamingRequest, StreamingWrapper, ToolManifest,
};

fn wrapper_for(client: &Arc<MockClient>, manifest: ToolManifest) -> (ServiceRegistry, StreamingWrapper) {
    let registry = register(builder(), client).manifest(manifest).build().unwrap();
    let wrapper = StreamingWrapper::new(registry.clone());
    (registry, wrapper)
}

fn streamed(id: &str, service: &str) -> ToolManifest {
    ToolManifest::new(id, service).with_streaming(StreamingConfig::default())
}

async fn collect(wrapper: &StreamingWrapper, request: StreamingRequest) -> Vec<StreamEvent> {
    let response = wrapper.execute_streaming(request).unwrap();
    response.stream.collect().await
}

fn types(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::event_type).collect()
}

fn data_payloads(events: &[StreamEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            StreamEventKind::Data { payload } => Some(payload.data.clone()),
            _ => None,
        })
        .collect()
}

fn assert_well_formed(events: &[StreamEvent]) {
    assert!(!events.is_empty());
    assert_eq!(events[0].event_type(), "start");
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    let request_id = &events[0].request_id;
    assert!(events.iter().all(|e| &e.request_id == request_id));
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_stream_reports_progress() {
        let client = MockClient::new("docs", &[]).shared();
        client.set_call_delay(Duration::from_millis(200));
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let options = StreamingOptions { progress_interval_ms: Some(20), ..Default::default() };
        let request = StreamingRequest::new("search_docs", json!({"q": "q3"})).with_options(options);
        let events = collect(&wrapper, request).await;

        assert_well_formed(&events);
        assert_eq!(types(&events), vec!["start", "progress", "progress", "progress", "data", "end"]);

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match &e.kind {
                StreamEventKind::Progress { payload } => Some(payload.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![25, 50, 75]);

        match &events[0].kind {
            StreamEventKind::Start { payload } => {
                assert_eq!(payload.service, "docs");
                assert_eq!(payload.mode, StreamingMode::Synthetic);
            }
            other => panic!("expected start, got {other:?}"),
        }
        assert_eq!(data_payloads(&events)[0]["tool"], "search_docs");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_progress_can_be_disabled() {
        let client = MockClient::new("docs", &[]).shared();
        client.set_call_delay(Duration::from_millis(50));
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let options = StreamingOptions {
            enable_progress: false,
            progress_interval_ms: Some(10),
            ..Default::default()
        };
        let request = StreamingRequest::new("search_docs", json!({})).with_options(options);
        let events = collect(&wrapper, request).await;

        assert_eq!(types(&events), vec!["start", "data", "end"]);
    }

    #[tokio::test]
    async fn test_null_arguments_become_empty_object() {
        let client = MockClient::new("docs", &[]).shared();
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let events = collect(&wrapper, StreamingRequest::new("search_docs", Value::Null)).await;
        assert_well_formed(&events);
        assert_eq!(data_payloads(&events)[0]["args"], json!({}));
    }

    #[tokio::test]
    async fn test_end_counts_data_events() {
        let client = MockClient::new("docs", &[]).shared();
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let events = collect(&wrapper, StreamingRequest::new("search_docs", json!({}))).await;
        match &events.last().unwrap().kind {
            StreamEventKind::End { payload } => assert_eq!(payload.data_events, 1),
            other => panic!("expected end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_render_as_sse_frames() {
        let client = MockClient::new("docs", &[]).shared();
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let events = collect(&wrapper, StreamingRequest::new("search_docs", json!({}))).await;
        for event in &events {
            let frame = event.to_sse_frame().unwrap();
            let body = frame.strip_prefix("data: ").unwrap().trim_end();
            let parsed: Value = serde_json::from_str(body).unwrap();
            assert_eq!(parsed["type"], event.event_type());
            assert_eq!(parsed["toolName"], "search_docs");
        }
    }

    #[tokio::test]
    async fn test_call_runs_on_announced_service() {
        let primary = MockClient::new("primary", &[]).shared();
        let secondary = MockClient::new("secondary", &[]).shared();
        primary.set_health(ProbeResult::unhealthy("connection refused"));

        let policy = HealthPolicy { failure_threshold: 1, ..HealthPolicy::default() };
        let registry = register(register(builder().health_policy(policy), &primary), &secondary)
            .manifest(streamed("search_docs", "primary").with_priority(10))
            .manifest(streamed("search_docs", "secondary"))
            .build()
            .unwrap();
        let wrapper = StreamingWrapper::new(registry.clone());

        // Routed to primary, which goes DOWN before the producer runs.
        let response = wrapper.execute_streaming(StreamingRequest::new("search_docs", json!({}))).unwrap();
        registry.check_all_services_health().await;
        assert_eq!(registry.get_service_status()["primary"].status, HealthState::Down);

        let events: Vec<StreamEvent> = response.stream.collect().await;
        assert_well_formed(&events);
        match &events[0].kind {
            StreamEventKind::Start { payload } => assert_eq!(payload.service, "primary"),
            other => panic!("expected start, got {other:?}"),
        }
        assert_eq!(data_payloads(&events)[0]["service"], "primary");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
    }
}

// ============================================================================
// Chunking
// ============================================================================

mod chunking {
    use super::*;

    fn chunked_manifest(chunk_size: Option<usize>) -> ToolManifest {
        ToolManifest::new("list_tasks", "tasks").with_streaming(StreamingConfig {
            supports_partial_results: true,
            chunk_size,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_array_result_split_into_chunks() {
        let client = MockClient::new("tasks", &[]).shared();
        client.respond(Ok(json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10])));
        let (_registry, wrapper) = wrapper_for(&client, chunked_manifest(Some(3)));

        let events = collect(&wrapper, StreamingRequest::new("list_tasks", json!({}))).await;
        assert_well_formed(&events);

        let chunks: Vec<(usize, usize, Value)> = events
            .iter()
            .filter_map(|e| match &e.kind {
                StreamEventKind::Data { payload } => {
                    let info = payload.chunk.as_ref().unwrap();
                    Some((info.index, info.total, payload.data.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            chunks,
            vec![
                (0, 4, json!([1, 2, 3])),
                (1, 4, json!([4, 5, 6])),
                (2, 4, json!([7, 8, 9])),
                (3, 4, json!([10])),
            ]
        );
    }

    #[tokio::test]
    async fn test_request_chunk_size_overrides_manifest() {
        let client = MockClient::new("tasks", &[]).shared();
        client.respond(Ok(json!(["a", "b", "c", "d"])));
        let (_registry, wrapper) = wrapper_for(&client, chunked_manifest(Some(3)));

        let options = StreamingOptions { chunk_size: Some(2), ..Default::default() };
        let request = StreamingRequest::new("list_tasks", json!({})).with_options(options);
        let events = collect(&wrapper, request).await;

        assert_eq!(data_payloads(&events), vec![json!(["a", "b"]), json!(["c", "d"])]);
    }

    #[tokio::test]
    async fn test_incremental_data_opt_out_sends_one_event() {
        let client = MockClient::new("tasks", &[]).shared();
        client.respond(Ok(json!([1, 2, 3, 4])));
        let (_registry, wrapper) = wrapper_for(&client, chunked_manifest(Some(1)));

        let options = StreamingOptions { enable_incremental_data: false, ..Default::default() };
        let request = StreamingRequest::new("list_tasks", json!({})).with_options(options);
        let events = collect(&wrapper, request).await;

        assert_eq!(data_payloads(&events), vec![json!([1, 2, 3, 4])]);
    }

    #[tokio::test]
    async fn test_short_or_scalar_results_not_chunked() {
        let client = MockClient::new("tasks", &[]).shared();
        client.respond(Ok(json!([1, 2])));
        client.respond(Ok(json!({"total": 2})));
        let (_registry, wrapper) = wrapper_for(&client, chunked_manifest(Some(5)));

        for expected in [json!([1, 2]), json!({"total": 2})] {
            let events = collect(&wrapper, StreamingRequest::new("list_tasks", json!({}))).await;
            assert_eq!(data_payloads(&events), vec![expected]);
        }
    }
}

// ============================================================================
// Failures
// ============================================================================

mod failures {
    use super::*;

    fn error_of(events: &[StreamEvent]) -> &toolrelay::mcp::StreamErrorInfo {
        match &events.last().unwrap().kind {
            StreamEventKind::Error { error } => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_ends_with_error_event() {
        let client = MockClient::new("docs", &[]).shared();
        client.fail_with(ErrorCategory::Authentication, 1);
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let events = collect(&wrapper, StreamingRequest::new("search_docs", json!({}))).await;
        assert_well_formed(&events);
        assert!(!types(&events).contains(&"end"));
        assert!(!types(&events).contains(&"data"));

        let error = error_of(&events);
        assert_eq!(error.category, ErrorCategory::Authentication);
        assert!(!error.recoverable);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_recoverable() {
        let client = MockClient::new("docs", &[]).shared();
        client.fail_with(ErrorCategory::ServerError, 3);
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let events = collect(&wrapper, StreamingRequest::new("search_docs", json!({}))).await;
        let error = error_of(&events);
        assert!(error.recoverable);
        assert_eq!(error.category, ErrorCategory::ServerError);
        assert!(error.message.contains("currently unavailable"));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_before_streaming() {
        let client = MockClient::new("docs", &["plain_tool"]).shared();
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let empty = wrapper.execute_streaming(StreamingRequest::new("  ", json!({}))).unwrap_err();
        assert_eq!(empty.category(), ErrorCategory::Validation);

        let bad_args = wrapper
            .execute_streaming(StreamingRequest::new("search_docs", json!(["not", "an", "object"])))
            .unwrap_err();
        assert_eq!(bad_args.category(), ErrorCategory::Validation);

        let unknown = wrapper
            .execute_streaming(StreamingRequest::new("missing_tool", json!({})))
            .unwrap_err();
        assert_eq!(unknown.category(), ErrorCategory::Configuration);

        let not_streamable = wrapper
            .execute_streaming(StreamingRequest::new("plain_tool", json!({})))
            .unwrap_err();
        assert_eq!(not_streamable.category(), ErrorCategory::Validation);
        assert!(!not_streamable.is_retryable());

        assert_eq!(wrapper.active_streams(), 0);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_destroyed_registry_rejects_streams() {
        let client = MockClient::new("docs", &[]).shared();
        let (registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));
        registry.destroy();

        let err = wrapper
            .execute_streaming(StreamingRequest::new("search_docs", json!({})))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}

// ============================================================================
// Native Streaming
// ============================================================================

mod native {
    use super::*;

    fn native_manifest() -> ToolManifest {
        ToolManifest::new("draft_reply", "mail").with_streaming(StreamingConfig {
            mode: StreamingMode::Native,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_native_partials_precede_final_result() {
        let client = MockClient::new("mail", &[])
            .native(vec![json!({"text": "Hel"}), json!({"text": "lo"})])
            .shared();
        let (_registry, wrapper) = wrapper_for(&client, native_manifest());

        let events = collect(&wrapper, StreamingRequest::new("draft_reply", json!({}))).await;
        assert_well_formed(&events);
        assert_eq!(types(&events), vec!["start", "data", "data", "data", "end"]);

        let partial_flags: Vec<bool> = events
            .iter()
            .filter_map(|e| match &e.kind {
                StreamEventKind::Data { payload } => Some(payload.partial),
                _ => None,
            })
            .collect();
        assert_eq!(partial_flags, vec![true, true, false]);

        match &events[0].kind {
            StreamEventKind::Start { payload } => assert_eq!(payload.mode, StreamingMode::Native),
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_native_failure_is_not_retried() {
        let client = MockClient::new("mail", &[]).native(vec![json!({"text": "Hel"})]).shared();
        client.fail_with(ErrorCategory::Network, 1);
        let (_registry, wrapper) = wrapper_for(&client, native_manifest());

        let events = collect(&wrapper, StreamingRequest::new("draft_reply", json!({}))).await;
        assert_eq!(types(&events), vec!["start", "data", "error"]);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_synthetic_with_status() {
        let client = MockClient::new("mail", &[]).shared();
        let (_registry, wrapper) = wrapper_for(&client, native_manifest());

        let events = collect(&wrapper, StreamingRequest::new("draft_reply", json!({}))).await;
        assert_well_formed(&events);
        assert_eq!(events[1].event_type(), "status");
        match &events[0].kind {
            StreamEventKind::Start { payload } => assert_eq!(payload.mode, StreamingMode::Synthetic),
            other => panic!("expected start, got {other:?}"),
        }

        let quiet = StreamingOptions { enable_status_updates: false, ..Default::default() };
        let events = collect(&wrapper, StreamingRequest::new("draft_reply", json!({})).with_options(quiet)).await;
        assert!(!types(&events).contains(&"status"));
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let client = MockClient::new("docs", &[]).shared();
        client.set_call_delay(Duration::from_secs(10));
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let mut response = wrapper
            .execute_streaming(StreamingRequest::new("search_docs", json!({})))
            .unwrap();
        let first = response.stream.next().await.unwrap();
        assert_eq!(first.event_type(), "start");
        assert_eq!(wrapper.active_streams(), 1);

        drop(response);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(wrapper.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_streams_tracked() {
        let client = MockClient::new("docs", &[]).shared();
        client.set_call_delay(Duration::from_millis(100));
        let (_registry, wrapper) = wrapper_for(&client, streamed("search_docs", "docs"));

        let a = wrapper.execute_streaming(StreamingRequest::new("search_docs", json!({"n": 1}))).unwrap();
        let b = wrapper.execute_streaming(StreamingRequest::new("search_docs", json!({"n": 2}))).unwrap();
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(wrapper.active_streams(), 2);

        let (events_a, events_b): (Vec<_>, Vec<_>) = tokio::join!(a.stream.collect(), b.stream.collect());
        assert_well_formed(&events_a);
        assert_well_formed(&events_b);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(wrapper.active_streams(), 0);
    }
}
