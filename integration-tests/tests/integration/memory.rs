// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use testpool_runner::{
    config::MemoryThreshold,
    reporter::events::RunEventKind,
    worker::{FixedMemoryUsage, TerminateReason},
};

#[test]
fn memory_pressure_replaces_worker_before_each_item() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let record = ws.path("items.log");

    let items = ["a", "b", "c"]
        .into_iter()
        .map(|id| action(id, json!({ "action": "pass", "record": record })))
        .collect();
    let output = run(&profile, items, vec![], |builder| {
        builder
            .set_memory_threshold(MemoryThreshold::new(0.5).expect("valid threshold"))
            .set_memory_monitor(Arc::new(FixedMemoryUsage(0.9)));
    })?;

    assert!(output.summary.stats.is_success());
    assert_eq!(output.summary.stats.workers_replaced, 3);
    assert_eq!(
        ws.record_pids("items.log")?.len(),
        3,
        "each item ran in its own process"
    );
    assert_eq!(
        output.count_events(|kind| matches!(
            kind,
            RunEventKind::WorkerReplaced {
                reason: TerminateReason::MemoryPressure,
                ..
            }
        )),
        3
    );
    Ok(())
}

#[test]
fn usage_under_threshold_keeps_worker() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let record = ws.path("items.log");

    let items = ["a", "b", "c"]
        .into_iter()
        .map(|id| action(id, json!({ "action": "pass", "record": record })))
        .collect();
    let output = run(&profile, items, vec![], |builder| {
        builder
            .set_memory_threshold(MemoryThreshold::new(0.5).expect("valid threshold"))
            .set_memory_monitor(Arc::new(FixedMemoryUsage(0.5)));
    })?;

    // The threshold must be strictly exceeded.
    assert_eq!(output.summary.stats.workers_replaced, 0);
    assert_eq!(ws.record_pids("items.log")?.len(), 1);
    Ok(())
}
