//! End-to-end stream lifecycle tests against the mock backend.

mod common;

use common::{connect_context, connected_context, eventually, fast_config, MockBackend};
use parking_lot::Mutex;
use std::sync::Arc;
use streamctl::pipeline::PipelineError;
use streamctl::streams::{StreamError, ERROR_METADATA_KEY};
use streamctl::ControlContext;
use streamctl_types::messages::PipelineErrorReport;
use streamctl_types::{
    CreateStreamRequest, DestinationKind, PipelineState, ServerMessage, SourceKind,
    StreamDestination, StreamSource, StreamStatus, StreamType,
};

fn live_test_stream() -> CreateStreamRequest {
    CreateStreamRequest::new("lobby camera", StreamType::Live, StreamSource::test())
}

#[tokio::test]
async fn test_live_stream_goes_active() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;

    let stream = ctx.streams.create_stream(live_test_stream()).await.unwrap();
    assert_eq!(stream.status, StreamStatus::Idle);
    assert_eq!(stream.pipeline.as_ref().unwrap().state(), PipelineState::Null);
    assert!(ctx.health.is_registered(&stream.id));

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let log = statuses.clone();
    let _sub = ctx.streams.subscribe_to_stream(&stream.id, move |s| {
        let mut log = log.lock();
        if log.last() != Some(&s.status) {
            log.push(s.status);
        }
    });

    let active = ctx.streams.start_stream(&stream.id).await.unwrap();
    assert_eq!(active.status, StreamStatus::Active);
    assert_eq!(active.pipeline.unwrap().state(), PipelineState::Receiving);
    assert_eq!(
        *statuses.lock(),
        vec![StreamStatus::Idle, StreamStatus::Starting, StreamStatus::Active]
    );
    ctx.shutdown();
}

#[tokio::test]
async fn test_over_budget_transcode_is_rejected() {
    let mock = MockBackend::start().await;
    let mut config = fast_config();
    config.resources.max_cpu = 10.0;
    let ctx = connected_context(&mock, config).await;

    let availability = ctx
        .resources
        .check_availability(StreamType::Transcode, Default::default());
    assert!(!availability.available);
    assert_eq!(availability.reason.as_deref(), Some("Insufficient CPU resources"));

    let request = CreateStreamRequest::new("encoder", StreamType::Transcode, StreamSource::test())
        .with_destination(StreamDestination::new(DestinationKind::Null, None));
    let err = ctx.streams.create_stream(request).await.unwrap_err();
    assert!(matches!(err, StreamError::Resources(_)));
    assert_eq!(err.to_string(), "Insufficient CPU resources");

    assert_eq!(ctx.resources.usage().streams, 0);
    assert!(ctx.health.registered_streams().is_empty());
    assert!(ctx.streams.list_streams().is_empty());
    assert_eq!(mock.count_received("createPipeline"), 0);
    ctx.shutdown();
}

#[tokio::test]
async fn test_failed_stop_leaves_stream_active() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;
    ctx.streams.start_stream(&id).await.unwrap();

    mock.configure(|b| b.fail_stop = true);
    let err = ctx.streams.stop_stream(&id).await.unwrap_err();
    assert!(err.to_string().contains("Failed to pause pipeline"), "{}", err);

    let stream = ctx.streams.get_stream(&id).unwrap();
    assert_eq!(stream.status, StreamStatus::Active);
    assert!(!stream.metadata.contains_key(ERROR_METADATA_KEY));
    ctx.shutdown();
}

#[tokio::test]
async fn test_failed_start_marks_stream_error() {
    let mock = MockBackend::start().await;
    mock.configure(|b| b.fail_start = Some("no element \"srtsrc\"".to_string()));
    let ctx = connected_context(&mock, fast_config()).await;
    let request = CreateStreamRequest::new(
        "contribution",
        StreamType::Relay,
        StreamSource::new(SourceKind::Srt, Some("srt://0.0.0.0:9000?mode=listener".to_string())),
    );
    let id = ctx.streams.create_stream(request).await.unwrap().id;

    assert!(ctx.streams.start_stream(&id).await.is_err());
    let stream = ctx.streams.get_stream(&id).unwrap();
    assert_eq!(stream.status, StreamStatus::Error);
    assert!(stream.metadata[ERROR_METADATA_KEY].contains("srtsrc"));
    ctx.shutdown();
}

#[tokio::test]
async fn test_start_confirmed_as_error_fails_stream() {
    let mock = MockBackend::start().await;
    mock.configure(|b| b.start_state = PipelineState::Error);
    let ctx = connected_context(&mock, fast_config()).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;

    let err = ctx.streams.start_stream(&id).await.unwrap_err();
    assert!(matches!(
        err,
        StreamError::Pipeline(PipelineError::UnexpectedState { state: PipelineState::Error, .. })
    ));

    let stream = ctx.streams.get_stream(&id).unwrap();
    assert_eq!(stream.status, StreamStatus::Error);
    assert!(stream.metadata[ERROR_METADATA_KEY].contains("ERROR"));
    assert_eq!(stream.pipeline.unwrap().state(), PipelineState::Error);
    ctx.shutdown();
}

#[tokio::test]
async fn test_start_confirmed_as_null_never_goes_active() {
    let mock = MockBackend::start().await;
    mock.configure(|b| b.start_state = PipelineState::Null);
    let mut config = fast_config();
    config.connection.command_timeout_ms = 300;
    let ctx = connected_context(&mock, config).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;

    let err = ctx.streams.start_stream(&id).await.unwrap_err();
    assert!(matches!(err, StreamError::Pipeline(PipelineError::Timeout { .. })));

    let stream = ctx.streams.get_stream(&id).unwrap();
    assert_eq!(stream.status, StreamStatus::Error);
    assert_eq!(stream.pipeline.unwrap().state(), PipelineState::Null);
    ctx.shutdown();
}

#[tokio::test]
async fn test_stream_created_offline_is_usable_after_connect() {
    let mock = MockBackend::start().await;
    let ctx = ControlContext::with_endpoints(&fast_config(), vec![mock.url()]).unwrap();
    let stream = ctx.streams.create_stream(live_test_stream()).await.unwrap();
    let pipeline_id = stream.pipeline_id.clone().unwrap();
    assert_eq!(ctx.pipelines.connection().queued_len(), 1);

    // The greeting list predates the queued creation
    connect_context(&mock, &ctx).await;
    assert!(eventually(|| ctx.pipelines.get_pipeline(&pipeline_id).is_some()).await);

    let pipelines = ctx.pipelines.fetch_pipelines().await.unwrap();
    assert!(pipelines.iter().any(|p| p.id == pipeline_id));
    assert_eq!(mock.pipeline_ids(), vec![pipeline_id.clone()]);

    let active = ctx.streams.start_stream(&stream.id).await.unwrap();
    assert_eq!(active.status, StreamStatus::Active);
    assert_eq!(active.pipeline.unwrap().state(), PipelineState::Receiving);
    ctx.shutdown();
}

#[tokio::test]
async fn test_runtime_error_fails_active_stream() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;
    let stream = ctx.streams.create_stream(live_test_stream()).await.unwrap();
    ctx.streams.start_stream(&stream.id).await.unwrap();

    mock.push(&ServerMessage::PipelineError(PipelineErrorReport {
        id: stream.pipeline_id.clone(),
        error_code: "runtime".to_string(),
        error_message: "Internal data stream error".to_string(),
        details: Some("streaming stopped, reason not-negotiated (-4)".to_string()),
    }));

    assert!(
        eventually(|| ctx
            .streams
            .get_stream(&stream.id)
            .is_some_and(|s| s.status == StreamStatus::Error))
        .await
    );
    let failed = ctx.streams.get_stream(&stream.id).unwrap();
    assert!(failed.metadata[ERROR_METADATA_KEY].contains("not-negotiated"));
    ctx.shutdown();
}

#[tokio::test]
async fn test_stop_then_delete() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;
    ctx.streams.start_stream(&id).await.unwrap();

    let paused = ctx.streams.stop_stream(&id).await.unwrap();
    assert_eq!(paused.status, StreamStatus::Paused);
    assert_eq!(paused.pipeline.unwrap().state(), PipelineState::Paused);

    assert!(ctx.streams.delete_stream(&id).await);
    assert!(ctx.streams.get_stream(&id).is_none());
    assert_eq!(ctx.resources.usage().streams, 0);
    assert!(!ctx.health.is_registered(&id));
    assert!(eventually(|| mock.pipeline_ids().is_empty()).await);
    assert!(!ctx.streams.delete_stream(&id).await);
    ctx.shutdown();
}

#[tokio::test]
async fn test_delete_running_stream_stops_first() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;
    ctx.streams.start_stream(&id).await.unwrap();

    assert!(ctx.streams.delete_stream(&id).await);
    assert!(eventually(|| mock.count_received("deletePipeline") == 1).await);
    let kinds: Vec<&str> = mock
        .received_kinds()
        .into_iter()
        .filter(|k| matches!(*k, "stopPipeline" | "deletePipeline"))
        .collect();
    assert_eq!(kinds, vec!["stopPipeline", "deletePipeline"]);
    ctx.shutdown();
}

#[tokio::test]
async fn test_restart_cycles_pipeline() {
    let mock = MockBackend::start().await;
    let ctx = connected_context(&mock, fast_config()).await;
    let id = ctx.streams.create_stream(live_test_stream()).await.unwrap().id;
    ctx.streams.start_stream(&id).await.unwrap();

    let restarted = ctx.streams.restart_stream(&id).await.unwrap();
    assert_eq!(restarted.status, StreamStatus::Active);
    assert_eq!(mock.count_received("stopPipeline"), 1);
    assert_eq!(mock.count_received("startPipeline"), 2);
    ctx.shutdown();
}
