//! End-to-end graph lifecycle tests against a mock function runtime.

mod common;

use std::time::Duration;

use common::{RPC_TIMEOUT, closure, memory_provider, mock_runtime, start_engine};
use fnflow_core::CoreError;
use fnflow_core::model::{AddStageSpec, GraphState, StageOperation, StageStatus};
use fnflow_core::stream::LifecycleEvent;
use fnflow_protocol::{CompletionResult, Datum, ErrorKind};
use uuid::Uuid;

fn graph_id() -> String {
    Uuid::new_v4().to_string()
}

#[tokio::test]
async fn test_supply_dispatches_and_yields_result() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager
        .create_graph(&gid, "fn", RPC_TIMEOUT)
        .await
        .expect("create graph");

    let added = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:hi")),
            RPC_TIMEOUT,
        )
        .await
        .expect("add supply");
    assert_eq!(added.stage_id, "0");

    let result = manager
        .get_stage_result(&gid, &added.stage_id, RPC_TIMEOUT)
        .await
        .expect("stage result");
    assert_eq!(result.status, StageStatus::Succeeded);
    assert_eq!(result.result, CompletionResult::success(Datum::text("hi")));
}

#[tokio::test]
async fn test_continuation_receives_dependency_result_as_argument() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:payload")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    let then = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenApply)
                .with_dependencies(vec!["0".to_string()])
                .with_closure(closure("arg")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    // The `arg` directive echoes the first argument datum back, so the
    // continuation's result proves the dependency result was relayed.
    let result = manager
        .get_stage_result(&gid, &then.stage_id, RPC_TIMEOUT)
        .await
        .expect("continuation result");
    assert_eq!(
        result.result,
        CompletionResult::success(Datum::text("payload"))
    );
}

#[tokio::test]
async fn test_combine_fails_fast_without_dispatching() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("error:split failure")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("slow:300:late")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    let combined = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenCombine)
                .with_dependencies(vec!["0".to_string(), "1".to_string()])
                .with_closure(closure("echo:never")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, &combined.stage_id, RPC_TIMEOUT)
        .await
        .expect("combined result");
    assert_eq!(result.status, StageStatus::Failed);
    assert_eq!(
        result.result.datum,
        Datum::error(ErrorKind::UnknownError, "split failure")
    );
    // The combined closure was never sent to the runtime.
    assert_eq!(mock.state.count("echo:never"), 0);
}

#[tokio::test]
async fn test_any_of_completes_with_first_outcome() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("slow:300:slowpoke")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:fast")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    let any = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::AnyOf)
                .with_dependencies(vec!["0".to_string(), "1".to_string()]),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, &any.stage_id, RPC_TIMEOUT)
        .await
        .expect("anyOf result");
    assert_eq!(result.result, CompletionResult::success(Datum::text("fast")));

    // The slow loser lands later; the anyOf outcome must not move.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let result = manager
        .get_stage_result(&gid, &any.stage_id, RPC_TIMEOUT)
        .await
        .expect("anyOf result again");
    assert_eq!(result.result, CompletionResult::success(Datum::text("fast")));
}

#[tokio::test]
async fn test_external_completion_round_trip_and_idempotence() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let stage = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ExternalCompletion),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let first = manager
        .complete_stage_externally(
            &gid,
            &stage.stage_id,
            CompletionResult::success(Datum::text("from outside")),
            RPC_TIMEOUT,
        )
        .await
        .expect("first completion");
    assert!(first.newly_completed);

    // Redelivery of the same completion is a no-op.
    let second = manager
        .complete_stage_externally(
            &gid,
            &stage.stage_id,
            CompletionResult::success(Datum::text("again")),
            RPC_TIMEOUT,
        )
        .await
        .expect("second completion");
    assert!(!second.newly_completed);

    let result = manager
        .get_stage_result(&gid, &stage.stage_id, RPC_TIMEOUT)
        .await
        .expect("result");
    assert_eq!(
        result.result,
        CompletionResult::success(Datum::text("from outside"))
    );
}

#[tokio::test]
async fn test_get_stage_result_times_out_without_touching_the_stage() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let stage = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ExternalCompletion),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let err = manager
        .get_stage_result(&gid, &stage.stage_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StageTimeout { .. }));

    // The stage is untouched and can still complete.
    let completed = manager
        .complete_stage_externally(
            &gid,
            &stage.stage_id,
            CompletionResult::success(Datum::Empty),
            RPC_TIMEOUT,
        )
        .await
        .expect("completion after poll timeout");
    assert!(completed.newly_completed);
}

#[tokio::test]
async fn test_compose_defers_to_referenced_stage() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();

    // 0: externally completed trigger; 1: compose returning a reference
    // to 2; 2: another external stage, completed last.
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ExternalCompletion),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    let compose = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenCompose)
                .with_dependencies(vec!["0".to_string()])
                .with_closure(closure("ref:2")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ExternalCompletion),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    manager
        .complete_stage_externally(
            &gid,
            "0",
            CompletionResult::success(Datum::Empty),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    // The compose dispatched and adopted stage 2, which is still open.
    let err = manager
        .get_stage_result(&gid, &compose.stage_id, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StageTimeout { .. }));

    manager
        .complete_stage_externally(
            &gid,
            "2",
            CompletionResult::success(Datum::text("inner value")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();

    let result = manager
        .get_stage_result(&gid, &compose.stage_id, RPC_TIMEOUT)
        .await
        .expect("composed result");
    assert_eq!(
        result.result,
        CompletionResult::success(Datum::text("inner value"))
    );
}

#[tokio::test]
async fn test_delay_fires_after_its_deadline_and_triggers_continuations() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let delay = manager
        .add_stage(
            &gid,
            AddStageSpec {
                delay_ms: Some(100),
                ..AddStageSpec::new(StageOperation::Delay)
            },
            RPC_TIMEOUT,
        )
        .await
        .expect("add delay");
    let run = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenRun)
                .with_dependencies(vec![delay.stage_id.clone()])
                .with_closure(closure("echo:after-delay")),
            RPC_TIMEOUT,
        )
        .await
        .expect("add continuation");

    // Nothing moves before the deadline.
    let err = manager
        .get_stage_result(&gid, &delay.stage_id, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StageTimeout { .. }));

    let result = manager
        .get_stage_result(&gid, &delay.stage_id, RPC_TIMEOUT)
        .await
        .expect("delay result");
    assert_eq!(result.result, CompletionResult::success(Datum::Empty));

    let result = manager
        .get_stage_result(&gid, &run.stage_id, RPC_TIMEOUT)
        .await
        .expect("continuation result");
    assert_eq!(result.status, StageStatus::Succeeded);
    assert_eq!(mock.state.count("echo:after-delay"), 1);
}

#[tokio::test]
async fn test_commit_completes_graph_and_publishes_lifecycle() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    let mut subscription = manager.subscribe_graph(&gid);

    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let stage = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:done")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    manager
        .get_stage_result(&gid, &stage.stage_id, RPC_TIMEOUT)
        .await
        .unwrap();

    let commit = manager.commit(&gid, RPC_TIMEOUT).await.expect("commit");
    assert_eq!(commit.state, GraphState::Completed);

    // The stream saw the whole story, ending in completion.
    let mut saw_created = false;
    let mut saw_stage = false;
    loop {
        let event = tokio::time::timeout(RPC_TIMEOUT, subscription.next())
            .await
            .expect("lifecycle event before timeout")
            .expect("stream open");
        match event {
            LifecycleEvent::GraphCreated { .. } => saw_created = true,
            LifecycleEvent::StageCompleted { .. } => saw_stage = true,
            LifecycleEvent::GraphCompleted { state, .. } => {
                assert_eq!(state, GraphState::Completed);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_created);
    assert!(saw_stage);
}

#[tokio::test]
async fn test_unhandled_failure_fails_the_graph() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let stage = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("error:unrecovered")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap();
    manager
        .get_stage_result(&gid, &stage.stage_id, RPC_TIMEOUT)
        .await
        .unwrap();

    let commit = manager.commit(&gid, RPC_TIMEOUT).await.expect("commit");
    assert_eq!(commit.state, GraphState::Failed);

    // Terminal graphs reject further mutation.
    let err = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenApply)
                .with_dependencies(vec!["0".to_string()])
                .with_closure(closure("echo:late")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GraphCompleted { .. }));
}

#[tokio::test]
async fn test_command_errors() {
    let mock = mock_runtime().await;
    let provider = memory_provider(100).await;
    let runtime = start_engine(provider, &mock.base_url).await;
    let manager = runtime.manager();

    // Unknown graph.
    let err = manager
        .add_stage(
            "no-such-graph",
            AddStageSpec::new(StageOperation::Supply).with_closure(closure("echo:x")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GraphNotFound { .. }));

    // Duplicate create.
    let gid = graph_id();
    manager.create_graph(&gid, "fn", RPC_TIMEOUT).await.unwrap();
    let err = manager
        .create_graph(&gid, "fn", RPC_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GraphAlreadyExists { .. }));

    // Malformed operation.
    let err = manager
        .add_stage(
            &gid,
            AddStageSpec::new(StageOperation::ThenCombine)
                .with_dependencies(vec!["0".to_string()])
                .with_closure(closure("echo:x")),
            RPC_TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));

    // Unknown stage id.
    let err = manager
        .get_stage_result(&gid, "42", RPC_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StageNotFound { .. }));
}
