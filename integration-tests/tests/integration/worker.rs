// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests that drive a single worker directly, without the runner.

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;
use testpool_runner::{
    errors::CallError,
    list::{ItemId, Payload},
    worker::{
        CallContext, CallResult, ItemStatus, ProcessExit, SetupRef, TerminateReason, Worker,
        WorkerId, WorkerOptions, WorkerState,
    },
};

fn execute(id: &str, setups: Vec<SetupRef>) -> CallContext {
    CallContext::Execute {
        item_id: ItemId::new(id),
        name: id.to_owned(),
        attempt: 1,
        setups,
    }
}

fn payload(value: Value) -> Payload {
    Payload::new(value)
}

async fn start() -> Worker {
    let mut options = WorkerOptions::new(fixture_worker());
    options.grace_period = Duration::from_secs(5);
    Worker::start(WorkerId(0), &options)
        .await
        .expect("fixture worker starts")
}

fn status(result: CallResult) -> ItemStatus {
    match result {
        CallResult::Executed(report) => report.status,
        other => panic!("expected an execution report, got {other:?}"),
    }
}

#[tokio::test]
async fn call_then_close() {
    let worker = start().await;
    assert_eq!(worker.state(), WorkerState::Connected);

    let result = worker
        .call(execute("a", vec![]), payload(json!({ "action": "pass" })))
        .await
        .expect("call succeeds");
    assert_eq!(status(result), ItemStatus::Passed);

    let result = worker
        .call(execute("b", vec![]), payload(json!({ "action": "fail" })))
        .await
        .expect("call succeeds");
    assert_eq!(status(result), ItemStatus::Failed);

    worker.close(Duration::from_secs(5)).await;
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert_eq!(worker.termination_reason(), Some(TerminateReason::Shutdown));
    assert_eq!(worker.exit_status(), Some(ProcessExit::Exited { code: 0 }));
}

#[tokio::test]
async fn crash_fails_the_outstanding_call() {
    let worker = start().await;

    let err = worker
        .call(
            execute("crash", vec![]),
            payload(json!({ "action": "exit", "code": 5 })),
        )
        .await
        .expect_err("the worker exits mid-call");
    assert!(matches!(err, CallError::WorkerTerminated { .. }), "{err:?}");

    // Already terminating on its own, so this waits for that to finish.
    worker.terminate(TerminateReason::SocketClosed).await;
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert_eq!(worker.exit_status(), Some(ProcessExit::Exited { code: 5 }));
    assert!(!worker.is_connected());
}

#[tokio::test]
async fn terminate_interrupts_a_hung_call() {
    let worker = start().await;

    let call = worker.call(
        execute("hang", vec![]),
        payload(json!({ "action": "sleep", "ms": 60_000 })),
    );
    let terminator = {
        let worker = worker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            worker.terminate(TerminateReason::Timeout).await;
        })
    };

    let err = tokio::time::timeout(Duration::from_secs(30), call)
        .await
        .expect("the call is cut short")
        .expect_err("the worker was terminated");
    assert_eq!(
        err.to_string(),
        CallError::WorkerTerminated {
            reason: TerminateReason::Timeout
        }
        .to_string()
    );
    terminator.await.expect("terminator task completes");
    assert_eq!(worker.termination_reason(), Some(TerminateReason::Timeout));
    assert!(worker.exit_status().is_some());
}

#[tokio::test]
async fn setup_values_reach_items() {
    let worker = start().await;

    let handle = match worker
        .call(
            CallContext::EvaluateSetup {
                name: "db".to_owned(),
                declared: true,
            },
            payload(json!({ "value": "postgres" })),
        )
        .await
        .expect("setup evaluates")
    {
        CallResult::SetupEvaluated { handle } => handle,
        other => panic!("expected a setup handle, got {other:?}"),
    };

    let setups = vec![SetupRef {
        name: "db".to_owned(),
        handle,
    }];
    let result = worker
        .call(
            execute("uses-db", setups),
            payload(json!({ "action": "expect-setup", "name": "db", "value": "postgres" })),
        )
        .await
        .expect("call succeeds");
    assert_eq!(status(result), ItemStatus::Passed);

    let err = worker
        .call(
            CallContext::EvaluateSetup {
                name: "ghost".to_owned(),
                declared: false,
            },
            payload(json!({})),
        )
        .await
        .expect_err("undeclared setups are refused");
    assert!(matches!(err, CallError::Remote { .. }), "{err:?}");

    worker.close(Duration::from_secs(5)).await;
}
