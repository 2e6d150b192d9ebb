// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests of the `testpool` binary, using command items.

use crate::fixtures::*;
use color_eyre::Result;
use serde_json::{Value, json};
use std::{
    io::{BufRead, BufReader},
    process::Command,
    time::{Duration, Instant},
};
use testpool_cli::TestpoolExitCode;
use testpool_runner::{
    list::{ItemId, StatusCacheStore},
    reporter::events::AttemptOutcome,
};

const CLI_CONFIG: &str = r#"
[profile.default]
workers = 2
terminate-grace-period = "200ms"
memory-threshold = 1.0

[profile.ci]
retries = 1
"#;

fn write_manifest(ws: &TempWorkspace, manifest: Value) -> Result<camino::Utf8PathBuf> {
    let path = ws.path("items.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(path)
}

fn command_item(id: &str, command: &[&str]) -> Value {
    json!({ "id": id, "name": id, "payload": { "command": command } })
}

fn run_cli(ws: &TempWorkspace, manifest: &camino::Utf8Path, extra: &[&str]) -> TestpoolOutput {
    TestpoolCli::new()
        .args(["run", "--workspace-root", ws.root().as_str()])
        .args(["--manifest", manifest.as_str()])
        .args(extra.iter().copied())
        .output()
}

#[cfg(unix)]
#[test]
fn passing_run_exits_cleanly_and_saves_statuses() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = write_manifest(
        &ws,
        json!({
            "items": [
                command_item("first", &["true"]),
                command_item("second", &["sh", "-c", "exit 0"]),
            ],
        }),
    )?;

    let output = run_cli(&ws, &manifest, &[]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::OK),
        "{output}"
    );
    let stderr = output.stderr_as_str();
    assert!(stderr.contains("PASS"), "{output}");

    let cache_path = ws
        .root()
        .join("target/testpool/default")
        .join(StatusCacheStore::FILE_NAME);
    let cache = StatusCacheStore::at_path(cache_path).load()?;
    assert_eq!(cache.len(), 2);
    assert_eq!(
        cache.get(&ItemId::new("first")),
        Some(AttemptOutcome::Passed)
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_item_fails_the_run() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = write_manifest(
        &ws,
        json!({
            "items": [
                command_item("good", &["true"]),
                command_item("bad", &["false"]),
            ],
        }),
    )?;

    let output = run_cli(&ws, &manifest, &[]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::TEST_RUN_FAILED),
        "{output}"
    );
    assert!(output.stderr_as_str().contains("FAIL"), "{output}");
    Ok(())
}

#[cfg(unix)]
#[test]
fn setup_environment_reaches_items() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = write_manifest(
        &ws,
        json!({
            "items": [{
                "id": "uses-db",
                "name": "uses the database",
                "setups": ["db"],
                "payload": { "command": ["sh", "-c", "test \"$DB_URL\" = postgres://local"] },
            }],
            "setups": [{
                "name": "db",
                "payload": { "command": ["echo", "DB_URL=postgres://local"] },
            }],
        }),
    )?;

    let output = run_cli(&ws, &manifest, &[]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::OK),
        "{output}"
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn invalid_manifest_is_a_setup_error() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = ws.path("items.json");
    std::fs::write(&manifest, "{ \"items\": [ { \"name\": \"no id\" } ] }")?;

    let output = run_cli(&ws, &manifest, &[]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::SETUP_ERROR),
        "{output}"
    );
    assert!(
        output.stderr_as_str().contains("failed to parse manifest"),
        "{output}"
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn unknown_profile_is_a_setup_error() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = write_manifest(&ws, json!({ "items": [command_item("a", &["true"])] }))?;

    let output = run_cli(&ws, &manifest, &["--profile", "nightly"]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::SETUP_ERROR),
        "{output}"
    );
    assert!(output.stderr_as_str().contains("nightly"), "{output}");
    Ok(())
}

#[cfg(unix)]
#[test]
fn profile_retries_apply() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let counter = ws.path("count");
    let script = format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}; test $n -ge 2"
    );
    let manifest = write_manifest(
        &ws,
        json!({ "items": [command_item("flaky", &["sh", "-c", &script])] }),
    )?;

    let output = run_cli(&ws, &manifest, &["--profile", "ci"]);
    assert_eq!(
        output.exit_status.code(),
        Some(TestpoolExitCode::OK),
        "a flaky item counts as passing: {output}"
    );
    assert_eq!(std::fs::read_to_string(&counter)?.trim(), "2");
    Ok(())
}

#[cfg(unix)]
#[test]
fn second_interrupt_terminates_running_items() -> Result<()> {
    let ws = TempWorkspace::new(CLI_CONFIG)?;
    let manifest = write_manifest(
        &ws,
        json!({ "items": [command_item("hangs", &["sleep", "60"])] }),
    )?;

    let mut child = TestpoolCli::new()
        .args(["--verbose", "run", "--workspace-root", ws.root().as_str()])
        .args(["--manifest", manifest.as_str()])
        .spawn()?;
    let stderr = child.stderr.take().expect("stderr is piped");
    let mut lines = BufReader::new(stderr).lines();
    for line in lines.by_ref() {
        if line?.contains("START") {
            break;
        }
    }
    let reader = std::thread::spawn(move || {
        let rest: Vec<String> = lines.map_while(|line| line.ok()).collect();
        rest
    });

    let interrupted_at = Instant::now();
    for _ in 0..2 {
        std::thread::sleep(Duration::from_millis(300));
        let status = Command::new("kill")
            .args(["-INT", &child.id().to_string()])
            .status()?;
        assert!(status.success(), "kill -INT failed: {status}");
    }

    let exit = loop {
        if let Some(exit) = child.try_wait()? {
            break exit;
        }
        if interrupted_at.elapsed() > Duration::from_secs(20) {
            child.kill()?;
            panic!("testpool kept running after a second interrupt");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    let stderr = reader.join().expect("stderr reader thread").join("\n");
    assert_eq!(
        exit.code(),
        Some(TestpoolExitCode::TEST_RUN_FAILED),
        "{stderr}"
    );
    assert!(stderr.contains("Killing due to second signal"), "{stderr}");
    Ok(())
}
