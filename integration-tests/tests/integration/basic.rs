// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use testpool_runner::{
    config::WorkerCount,
    list::{ItemId, StatusCache, StatusCacheStore, TestList},
    reporter::events::{AttemptOutcome, FinalStatus, RunEventKind},
    runner::TestRunnerBuilder,
};

#[test]
fn mixed_outcomes() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![
            pass("a"),
            fail("b"),
            action("c", json!({ "action": "error" })),
        ],
        vec![],
        |_| {},
    )?;

    let stats = &output.summary.stats;
    assert_eq!(stats.initial_run_count, 3);
    assert_eq!(stats.finished_count, 3);
    assert_eq!((stats.passed, stats.failed, stats.errored), (1, 1, 1));
    assert!(!stats.is_success());

    let ids: Vec<_> = output
        .summary
        .items
        .iter()
        .map(|result| result.instance.id().as_str().to_owned())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"], "summary is in discovery order");

    let failed = output.summary.item(&ItemId::new("b")).expect("b ran");
    assert_eq!(failed.attempts.len(), 1);
    assert_eq!(
        failed.attempts[0].message.as_deref(),
        Some("assertion failed")
    );
    assert_eq!(
        item_status(&output, "c"),
        FinalStatus::Finished(AttemptOutcome::Errored)
    );

    assert!(matches!(
        output.events.first().map(|event| &event.kind),
        Some(RunEventKind::RunStarted { item_count: 3, .. })
    ));
    assert!(matches!(
        output.events.last().map(|event| &event.kind),
        Some(RunEventKind::RunFinished { .. })
    ));
    Ok(())
}

#[test]
fn every_item_runs_exactly_once_across_workers() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let record = ws.path("items.log");

    let items = (0..12)
        .map(|n| {
            action(
                &format!("item-{n}"),
                json!({ "action": "sleep", "ms": 20, "record": record }),
            )
        })
        .collect();
    let output = run(&profile, items, vec![], |builder| {
        builder.set_workers(WorkerCount::Count(3));
    })?;

    assert!(output.summary.stats.is_success());
    assert_eq!(output.summary.stats.workers_started, 3);

    let mut names: Vec<_> = ws
        .records("items.log")?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    let mut expected: Vec<_> = (0..12).map(|n| format!("item-{n}")).collect();
    expected.sort();
    assert_eq!(names, expected, "no item ran twice and none was skipped");
    Ok(())
}

#[test]
fn retries_turn_failures_flaky() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let flaky = action(
        "flaky",
        json!({ "action": "fail-until", "counter": ws.path("counter"), "passes-on": 2 }),
    )
    .with_retries(1);
    let output = run(&profile, vec![flaky, fail("always-fails")], vec![], |builder| {
        builder.set_retries(testpool_runner::config::RetryPolicy::new_without_delay(2));
    })?;

    let result = output.summary.item(&ItemId::new("flaky")).expect("flaky ran");
    let outcomes: Vec<_> = result.attempts.iter().map(|attempt| attempt.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Failed, AttemptOutcome::Passed]
    );
    assert!(result.is_flaky());

    // Items without their own retry count get the run's.
    let failing = output
        .summary
        .item(&ItemId::new("always-fails"))
        .expect("always-fails ran");
    assert_eq!(failing.attempts.len(), 3);
    let numbers: Vec<_> = failing.attempts.iter().map(|attempt| attempt.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    assert_eq!(output.summary.stats.flaky, 1);
    assert_eq!(output.summary.stats.passed, 1);
    assert_eq!(output.summary.stats.failed, 1);
    assert_eq!(
        output.count_events(|kind| matches!(
            kind,
            RunEventKind::AttemptFinished {
                will_retry: Some(_),
                ..
            }
        )),
        3,
        "one retry for flaky, two for always-fails"
    );
    Ok(())
}

#[test]
fn failures_first_uses_previous_run() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let items = vec![pass("a"), fail("b"), pass("c")];

    let output = run(&profile, items.clone(), vec![], |_| {})?;
    let store = StatusCacheStore::at_path(profile.status_cache_path());
    let mut cache = store.load()?;
    assert!(cache.is_empty(), "no status cache before the first run");
    output.summary.update_status_cache(&mut cache);
    store.save(&cache)?;

    let mut cache = store.load()?;
    assert_eq!(cache.get(&ItemId::new("b")), Some(AttemptOutcome::Failed));

    // A new item has never been seen, so it goes between failures and passes.
    let mut items = items;
    items.push(pass("d"));
    let test_list = TestList::new(items, vec![])?;
    let mut builder = TestRunnerBuilder::default();
    builder
        .set_status_cache(std::mem::take(&mut cache))
        .set_failures_first(true);
    let runner = builder.build(&test_list, &profile, fixture_worker())?;
    let order: Vec<_> = runner
        .queue()
        .iter()
        .map(|instance| instance.id().as_str())
        .collect();
    assert_eq!(order, vec!["b", "d", "a", "c"]);

    let mut builder = TestRunnerBuilder::default();
    builder
        .set_status_cache(StatusCache::default())
        .set_failures_first(true);
    let runner = builder.build(&test_list, &profile, fixture_worker())?;
    let order: Vec<_> = runner
        .queue()
        .iter()
        .map(|instance| instance.id().as_str())
        .collect();
    assert_eq!(
        order,
        vec!["a", "b", "c", "d"],
        "empty cache keeps discovery order"
    );
    Ok(())
}

#[test]
fn retry_budget_bounds_attempts() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let output = run(
        &profile,
        vec![pass("one"), fail("two"), pass("three")],
        vec![],
        |builder| {
            builder.set_retries(testpool_runner::config::RetryPolicy::new_without_delay(1));
        },
    )?;

    let two = output.summary.item(&ItemId::new("two")).expect("two ran");
    let outcomes: Vec<_> = two.attempts.iter().map(|attempt| attempt.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Failed, AttemptOutcome::Failed]
    );
    for id in ["one", "three"] {
        let result = output.summary.item(&ItemId::new(id)).expect("item ran");
        assert_eq!(result.attempts.len(), 1, "{id} passed on the first attempt");
    }
    Ok(())
}
