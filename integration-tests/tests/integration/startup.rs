// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::{Result, eyre::bail};
use indoc::formatdoc;
use pretty_assertions::assert_eq;
use testpool_runner::{
    errors::{TestRunnerExecuteError, WorkerStartError},
    reporter::events::RunEventKind,
};

const STARTUP_ENV: &str = "FIXTURE_WORKER_STARTUP";

fn start_errors(result: Result<RunOutput, TestRunnerExecuteError>) -> Result<Vec<String>> {
    match result {
        Ok(_) => bail!("run should not have started"),
        Err(TestRunnerExecuteError::NoWorkersStarted { errors }) => {
            Ok(errors.iter().map(|error| format!("{error:?}")).collect())
        }
        Err(other) => bail!("unexpected error: {other}"),
    }
}

#[test]
fn worker_exiting_during_startup() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;

    let result = try_run(
        &profile,
        vec![pass("a")],
        vec![],
        |_| {},
        fixture_worker().env(STARTUP_ENV, "exit"),
    )?;
    let errors = start_errors(result)?;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("ExitedDuringStartup"), "{errors:?}");
    Ok(())
}

#[test]
fn transient_startup_failure_is_retried() -> Result<()> {
    let ws = TempWorkspace::new(FAST_CONFIG)?;
    let profile = ws.profile("default")?;
    let marker = ws.path("exited-once");

    let output = try_run(
        &profile,
        vec![pass("a")],
        vec![],
        |_| {},
        fixture_worker().env(STARTUP_ENV, format!("exit-once:{marker}")),
    )??;

    assert!(marker.exists(), "the first start attempt exited");
    assert!(output.summary.stats.is_success());
    assert_eq!(
        output.count_events(|kind| matches!(kind, RunEventKind::WorkerStarted { .. })),
        1
    );
    Ok(())
}

#[test]
fn worker_that_never_announces_a_port() -> Result<()> {
    let ws = TempWorkspace::new(&formatdoc! {r#"
        {FAST_CONFIG}
        connect-timeout = "300ms"
    "#})?;
    let profile = ws.profile("default")?;

    let result = try_run(
        &profile,
        vec![pass("a")],
        vec![],
        |_| {},
        fixture_worker().env(STARTUP_ENV, "hang"),
    )?;
    let errors = start_errors(result)?;
    assert!(errors[0].starts_with("ConnectTimeout"), "{errors:?}");
    Ok(())
}

#[test]
fn startup_hook_can_reject_workers() -> Result<()> {
    let ws = TempWorkspace::new(&formatdoc! {r#"
        {FAST_CONFIG}
        startup-hook = {{ reject = true }}
    "#})?;
    let profile = ws.profile("default")?;

    let result = try_run(&profile, vec![pass("a")], vec![], |_| {}, fixture_worker())?;
    let errors = start_errors(result)?;
    assert!(errors[0].starts_with("StartupHook"), "{errors:?}");
    Ok(())
}

#[test]
fn startup_hook_runs_before_items() -> Result<()> {
    let ws = TempWorkspace::new(&formatdoc! {r#"
        {FAST_CONFIG}
        startup-hook = {{ reject = false }}
    "#})?;
    let profile = ws.profile("default")?;

    let output = run(&profile, vec![pass("a"), pass("b")], vec![], |_| {})?;
    assert!(output.summary.stats.is_success());
    Ok(())
}

#[test]
fn start_error_messages() {
    let error = WorkerStartError::ConnectTimeout {
        timeout: std::time::Duration::from_millis(300),
    };
    assert_eq!(
        error.to_string(),
        "worker did not become ready within 300ms"
    );
}
