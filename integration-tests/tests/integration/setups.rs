// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use testpool_runner::{
    config::WorkerCount,
    list::{ItemId, SourceLocation},
    reporter::events::{AttemptOutcome, FinalStatus},
};

fn expects_db(id: &str) -> testpool_runner::list::TestItem {
    action(
        id,
        json!({ "action": "expect-setup", "name": "db", "value": 42 }),
    )
    .with_setup("db")
}

#[test]
fn setup_is_evaluated_once_per_worker() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let db = setup(
        "db",
        json!({ "value": 42, "record": ws.path("setups.log") }),
    );

    let output = run(
        &profile,
        vec![expects_db("x"), expects_db("y"), expects_db("z"), pass("no-setup")],
        vec![db],
        |_| {},
    )?;

    assert!(
        output.summary.stats.is_success(),
        "every item saw the setup's value"
    );
    let records = ws.records("setups.log")?;
    assert_eq!(
        records.len(),
        1,
        "one worker evaluates the setup once: {records:?}"
    );
    assert_eq!(records[0].0, "db");
    Ok(())
}

#[test]
fn each_worker_evaluates_its_own_setups() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let db = setup(
        "db",
        json!({ "value": 42, "record": ws.path("setups.log") }),
    );

    let items = (0..8).map(|n| expects_db(&format!("item-{n}"))).collect();
    let output = run(&profile, items, vec![db], |builder| {
        builder.set_workers(WorkerCount::Count(3));
    })?;

    assert!(output.summary.stats.is_success());
    let records = ws.records("setups.log")?;
    let pids = ws.record_pids("setups.log")?;
    assert!(
        records.len() <= 3,
        "at most one evaluation per worker: {records:?}"
    );
    assert_eq!(
        records.len(),
        pids.len(),
        "no worker evaluated twice: {records:?}"
    );
    Ok(())
}

#[test]
fn failed_setup_errors_dependents_without_reevaluating() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let mut broken = setup(
        "broken",
        json!({ "fail": true, "record": ws.path("setups.log") }),
    );
    broken.source = Some(SourceLocation {
        file: "suite/setups.rs".into(),
        line: 12,
    });

    let output = run(
        &profile,
        vec![
            pass("first").with_setup("broken"),
            pass("second").with_setup("broken"),
            pass("independent"),
        ],
        vec![broken],
        |_| {},
    )?;

    for id in ["first", "second"] {
        let result = output.summary.item(&ItemId::new(id)).expect("item ran");
        assert_eq!(
            result.status,
            FinalStatus::Finished(AttemptOutcome::Errored)
        );
        let message = result.attempts[0].message.as_deref().unwrap_or_default();
        assert!(
            message.contains("setup `broken` (declared at suite/setups.rs:12) failed"),
            "message names the setup and where it was declared: {message}"
        );
        assert!(message.contains("failed on purpose"), "{message}");
    }
    assert_eq!(
        item_status(&output, "independent"),
        FinalStatus::Finished(AttemptOutcome::Passed)
    );
    assert_eq!(
        ws.records("setups.log")?.len(),
        1,
        "the failure is cached on the worker"
    );
    Ok(())
}

#[test]
fn undeclared_setup_errors_the_item() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![pass("orphan").with_setup("missing"), pass("fine")],
        vec![],
        |_| {},
    )?;

    let result = output.summary.item(&ItemId::new("orphan")).expect("orphan ran");
    assert_eq!(
        result.status,
        FinalStatus::Finished(AttemptOutcome::Errored)
    );
    let message = result.attempts[0].message.as_deref().unwrap_or_default();
    assert!(message.contains("`missing` is not declared"), "{message}");
    assert_eq!(
        item_status(&output, "fine"),
        FinalStatus::Finished(AttemptOutcome::Passed)
    );
    Ok(())
}
