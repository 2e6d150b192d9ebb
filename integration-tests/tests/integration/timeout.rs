// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use testpool_runner::{
    list::ItemId,
    reporter::events::{AttemptOutcome, FinalStatus, RunEventKind},
    worker::TerminateReason,
};

fn hang(id: &str) -> testpool_runner::list::TestItem {
    action(id, json!({ "action": "sleep", "ms": 60_000 }))
}

#[test]
fn hung_item_times_out_and_worker_is_replaced() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(&profile, vec![hang("hang"), pass("after")], vec![], |builder| {
        builder.set_timeout(short_timeout());
    })?;

    let result = output.summary.item(&ItemId::new("hang")).expect("hang ran");
    assert_eq!(
        result.status,
        FinalStatus::Finished(AttemptOutcome::TimedOut)
    );
    assert_eq!(
        result.attempts[0].message.as_deref(),
        Some("timed out after 500ms")
    );
    assert!(
        result.attempts[0].duration < Duration::from_secs(30),
        "the attempt was cut short"
    );

    assert_eq!(
        item_status(&output, "after"),
        FinalStatus::Finished(AttemptOutcome::Passed)
    );
    assert_eq!(output.summary.stats.timed_out, 1);
    assert_eq!(
        output.count_events(|kind| matches!(
            kind,
            RunEventKind::WorkerReplaced {
                reason: TerminateReason::Timeout,
                ..
            }
        )),
        1
    );
    Ok(())
}

#[test]
fn item_timeout_overrides_run_timeout() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![hang("hang").with_timeout(Duration::from_millis(300))],
        vec![],
        |builder| {
            builder.set_timeout(Duration::from_secs(600));
        },
    )?;

    assert_eq!(
        item_status(&output, "hang"),
        FinalStatus::Finished(AttemptOutcome::TimedOut)
    );
    Ok(())
}

#[test]
fn diagnostics_are_attached_to_timeouts() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(&profile, vec![hang("hang")], vec![], |builder| {
        builder
            .set_timeout(short_timeout())
            .set_diagnostics_on_timeout(true);
    })?;

    let result = output.summary.item(&ItemId::new("hang")).expect("hang ran");
    let message = result.attempts[0].message.as_deref().unwrap_or_default();
    assert!(message.starts_with("timed out after 500ms"), "{message}");
    assert!(message.contains("worker diagnostics:"), "{message}");
    assert!(message.contains("fixture worker"), "{message}");
    Ok(())
}
