// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use testpool_runner::{
    list::ItemId,
    reporter::events::{AttemptOutcome, FinalStatus, RunEventKind},
    worker::WorkerId,
};

#[test]
fn crashed_worker_is_replaced() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let record = ws.path("items.log");

    let output = run(
        &profile,
        vec![
            action("before", json!({ "action": "pass", "record": record })),
            action(
                "crash",
                json!({ "action": "exit", "code": 7, "record": record }),
            ),
            action("after", json!({ "action": "pass", "record": record })),
        ],
        vec![],
        |_| {},
    )?;

    assert_eq!(
        item_status(&output, "crash"),
        FinalStatus::Finished(AttemptOutcome::Crashed)
    );
    assert_eq!(
        item_status(&output, "after"),
        FinalStatus::Finished(AttemptOutcome::Passed),
        "items after a crash still run"
    );

    let crash = output.summary.item(&ItemId::new("crash")).expect("crash ran");
    let message = crash.attempts[0].message.as_deref().unwrap_or_default();
    assert!(
        message.contains("exited with code 7"),
        "crash message includes the exit status: {message}"
    );

    let records = ws.records("items.log")?;
    let pid_of = |name: &str| {
        records
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pid)| *pid)
            .unwrap_or_else(|| panic!("{name} was recorded"))
    };
    assert_eq!(pid_of("before"), pid_of("crash"));
    assert_ne!(
        pid_of("crash"),
        pid_of("after"),
        "a new process ran `after`"
    );

    assert_eq!(output.summary.stats.crashed, 1);
    assert_eq!(output.summary.stats.workers_replaced, 1);
    assert_eq!(
        output.count_events(|kind| matches!(kind, RunEventKind::WorkerReplaced { .. })),
        1
    );
    Ok(())
}

#[test]
fn crash_is_retried_on_a_fresh_worker() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let item = action(
        "crash-once",
        json!({ "action": "crash-once", "marker": ws.path("crashed") }),
    )
    .with_retries(1);
    let output = run(&profile, vec![item], vec![], |_| {})?;

    let result = output
        .summary
        .item(&ItemId::new("crash-once"))
        .expect("crash-once ran");
    let attempts: Vec<_> = result
        .attempts
        .iter()
        .map(|attempt| (attempt.outcome, attempt.worker))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (AttemptOutcome::Crashed, WorkerId(0)),
            (AttemptOutcome::Passed, WorkerId(1)),
        ],
        "replacement workers get fresh IDs"
    );
    assert!(result.is_flaky());
    assert!(output.summary.stats.is_success());
    Ok(())
}
