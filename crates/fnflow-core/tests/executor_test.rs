//! Executor behavior: retries, backoff classification, garbage
//! replies, and function-to-function invocation.

mod common;

use common::{RPC_TIMEOUT, closure, memory_provider, mock_runtime, start_engine, start_engine_with,
    test_executor};
use fnflow_core::model::{AddStageSpec, Closure, StageOperation, StageStatus};
use fnflow_protocol::{CompletionResult, Datum, ErrorKind, HttpMethod};
use std::time::Duration;
use uuid::Uuid;

fn graph_id() -> String {
    Uuid::new_v4().to_string()
}

#[tokio::test]
async fn test_transient_server_errors_are_retried_until_success() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("flaky:2:finally")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, "0", RPC_TIMEOUT)
        .await
        .expect("flaky result");
    assert_eq!(
        result.result,
        CompletionResult::success(Datum::text("finally"))
    );
    // Two 500s, then the success: three attempts in one dispatch.
    assert_eq!(mock.state.count("flaky:2:finally"), 3);
}

#[tokio::test]
async fn test_exhausted_retries_record_the_last_outcome() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime =
        start_engine_with(provider, test_executor(&mock.base_url, 2), Duration::from_secs(60))
            .await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("boom")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, "0", RPC_TIMEOUT)
        .await
        .expect("exhausted result");
    assert_eq!(result.status, StageStatus::Failed);
    assert!(matches!(
        result.result.datum,
        Datum::Error {
            kind: ErrorKind::StageInvokeFailed,
            ..
        }
    ));
    assert_eq!(mock.state.count("boom"), 2);
}

#[tokio::test]
async fn test_garbage_reply_is_an_invalid_stage_response() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("garbage")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, "0", RPC_TIMEOUT)
        .await
        .expect("garbage result");
    assert_eq!(result.status, StageStatus::Failed);
    assert!(matches!(
        result.result.datum,
        Datum::Error {
            kind: ErrorKind::InvalidStageResponse,
            ..
        }
    ));
    // Garbage is not retriable.
    assert_eq!(mock.state.count("garbage"), 1);
}

#[tokio::test]
async fn test_transport_failure_maps_to_function_invoke_failed() {
    let provider = memory_provider(100).await;
    // Nothing listens here.
    let runtime = start_engine_with(
        provider,
        test_executor("http://127.0.0.1:9/r", 2),
        Duration::from_secs(60),
    )
    .await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:unreachable")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, "0", RPC_TIMEOUT)
        .await
        .expect("transport failure result");
    assert_eq!(result.status, StageStatus::Failed);
    assert!(matches!(
        result.result.datum,
        Datum::Error {
            kind: ErrorKind::FunctionInvokeFailed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_invoke_function_relays_http_request_and_captures_response() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();

    let request = Datum::HttpReq {
        method: HttpMethod::Post,
        headers: vec![],
        content_type: Some("text/plain".to_string()),
        body: b"ping".to_vec(),
    };
    let mut spec = AddStageSpec::new(StageOperation::InvokeFunction);
    spec.target_function = Some("other-fn".to_string());
    spec.closure = Some(Closure {
        content_type: "application/json".to_string(),
        data: serde_json::to_vec(&request).expect("encode request"),
    });
    manager.add_stage(&gid, spec, RPC_TIMEOUT).await.unwrap();

    let result = manager
        .get_stage_result(&gid, "0", RPC_TIMEOUT)
        .await
        .expect("invoke result");
    assert_eq!(result.status, StageStatus::Succeeded);
    match &result.result.datum {
        Datum::HttpResp {
            status_code, body, ..
        } => {
            assert_eq!(*status_code, 200);
            assert_eq!(body, b"invoked:ping");
        }
        other => panic!("expected an HTTP response datum, got {other:?}"),
    }
}
