// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use testpool_runner::{
    list::ItemId,
    reporter::events::{AttemptOutcome, CancelReason, FinalStatus, NotRunReason, RunEventKind},
};

#[test]
fn first_failure_cancels_the_run() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![fail("first").with_retries(2), pass("second"), pass("third")],
        vec![],
        |builder| {
            builder.set_fail_fast(true);
        },
    )?;

    // Fail-fast applies once the item has used up its retries.
    let first = output.summary.item(&ItemId::new("first")).expect("first ran");
    assert_eq!(first.attempts.len(), 3);
    assert_eq!(first.status, FinalStatus::Finished(AttemptOutcome::Failed));

    for id in ["second", "third"] {
        assert_eq!(
            item_status(&output, id),
            FinalStatus::NotRun(NotRunReason::Cancelled),
            "{id} was never dispatched"
        );
    }
    assert_eq!(output.summary.cancelled, Some(CancelReason::TestFailure));
    assert_eq!(output.summary.stats.not_run, 2);
    assert_eq!(
        output.count_events(|kind| matches!(kind, RunEventKind::RunCancelled { .. })),
        1
    );
    assert_eq!(
        output.count_events(|kind| matches!(
            kind,
            RunEventKind::ItemFinished {
                status: FinalStatus::NotRun(_),
                attempt_count: 0,
                ..
            }
        )),
        2,
        "cancelled items are still reported"
    );
    Ok(())
}

#[test]
fn item_can_opt_out_of_fail_fast() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![fail("tolerated").with_failfast(false), pass("next")],
        vec![],
        |builder| {
            builder.set_fail_fast(true);
        },
    )?;

    assert_eq!(
        item_status(&output, "next"),
        FinalStatus::Finished(AttemptOutcome::Passed)
    );
    assert_eq!(output.summary.cancelled, None);
    Ok(())
}

#[test]
fn item_can_opt_into_fail_fast() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![pass("ok"), fail("critical").with_failfast(true), pass("skipped")],
        vec![],
        |builder| {
            builder.set_fail_fast(false);
        },
    )?;

    assert_eq!(
        item_status(&output, "ok"),
        FinalStatus::Finished(AttemptOutcome::Passed)
    );
    assert_eq!(
        item_status(&output, "skipped"),
        FinalStatus::NotRun(NotRunReason::Cancelled)
    );
    assert!(matches!(
        output.events.iter().find_map(|event| match &event.kind {
            RunEventKind::RunCancelled { reason, item } => Some((*reason, item.clone())),
            _ => None,
        }),
        Some((CancelReason::TestFailure, Some(id))) if id == ItemId::new("critical")
    ));
    Ok(())
}

#[test]
fn in_flight_items_finish_after_cancellation() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let slow = action("slow", json!({ "action": "sleep", "ms": 1000 }));
    let output = run(
        &profile,
        vec![fail("first"), slow, pass("later"), pass("last")],
        vec![],
        |builder| {
            builder
                .set_workers(testpool_runner::config::WorkerCount::Count(2))
                .set_fail_fast(true);
        },
    )?;

    assert_eq!(output.summary.cancelled, Some(CancelReason::TestFailure));
    // The slow item is not pre-empted if the other worker already claimed it.
    let slow = item_status(&output, "slow");
    assert!(
        matches!(
            slow,
            FinalStatus::Finished(AttemptOutcome::Passed)
                | FinalStatus::NotRun(NotRunReason::Cancelled)
        ),
        "{slow:?}"
    );
    for id in ["later", "last"] {
        assert_eq!(
            item_status(&output, id),
            FinalStatus::NotRun(NotRunReason::Cancelled),
            "{id} was claimed after the failure"
        );
    }
    Ok(())
}

#[test]
fn claimed_items_keep_their_retries_after_cancellation() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    // Claimed by the second worker before the first item fails.
    let sibling = action("sibling", json!({ "action": "sleep", "ms": 2000 }))
        .with_timeout(Duration::from_millis(800))
        .with_retries(1);
    let output = run(&profile, vec![fail("fails"), sibling], vec![], |builder| {
        builder
            .set_workers(testpool_runner::config::WorkerCount::Count(2))
            .set_fail_fast(true);
    })?;

    assert_eq!(output.summary.cancelled, Some(CancelReason::TestFailure));
    let sibling = output
        .summary
        .item(&ItemId::new("sibling"))
        .expect("sibling was claimed");
    let outcomes: Vec<_> = sibling.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::TimedOut, AttemptOutcome::TimedOut],
        "the retry still runs after the run is cancelled"
    );
    assert_eq!(
        sibling.status,
        FinalStatus::Finished(AttemptOutcome::TimedOut)
    );
    Ok(())
}
