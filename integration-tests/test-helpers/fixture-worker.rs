// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A worker whose behavior is scripted by item and setup payloads.
//!
//! Item payloads look like `{ "action": "fail", "record": "/path/to/file" }`. Setup payloads look
//! like `{ "value": 42, "record": "/path/to/file" }`. When `record` is set, the worker appends a
//! `<name> <pid>` line to that file, which lets tests see which process did what.
//!
//! The `FIXTURE_WORKER_STARTUP` environment variable controls startup:
//!
//! * `exit`: exit with status 3 before the handshake.
//! * `hang`: never print the handshake.
//! * `exit-once:<path>`: like `exit`, but only if `<path>` doesn't exist yet (it is created).

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, de::DeserializeOwned};
use std::{fs::OpenOptions, io::Write, process::ExitCode, time::Duration};
use testpool_runner::{
    list::Payload,
    worker::{ExecutionReport, ItemRequest, ItemStatus, SetupValues, UnitHandler, serve},
};

const STARTUP_ENV: &str = "FIXTURE_WORKER_STARTUP";

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
enum ItemAction {
    Pass,
    Fail {
        #[serde(default)]
        message: Option<String>,
    },
    Error,
    Sleep {
        ms: u64,
    },
    Exit {
        code: i32,
    },
    /// Exits the first time it runs, then passes.
    CrashOnce {
        marker: Utf8PathBuf,
    },
    /// Fails until the item has run `passes-on` times.
    FailUntil {
        counter: Utf8PathBuf,
        passes_on: u32,
    },
    /// Passes if the named setup evaluated to `value`.
    ExpectSetup {
        name: String,
        value: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ItemPayload {
    #[serde(flatten)]
    action: ItemAction,
    #[serde(default)]
    record: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SetupPayload {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    record: Option<Utf8PathBuf>,
    #[serde(default)]
    fail: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StartupPayload {
    #[serde(default)]
    reject: bool,
}

struct FixtureHandler;

impl UnitHandler for FixtureHandler {
    type Context = serde_json::Value;

    fn startup(&self, payload: &Payload) -> Result<(), String> {
        let payload: StartupPayload = parse_or_default(payload)?;
        if payload.reject {
            return Err("startup hook rejected this worker".to_owned());
        }
        Ok(())
    }

    fn evaluate_setup(&self, name: &str, payload: &Payload) -> Result<serde_json::Value, String> {
        let payload: SetupPayload = parse_or_default(payload)?;
        if let Some(path) = &payload.record {
            record(path, name)?;
        }
        if payload.fail {
            return Err(format!("setup `{name}` failed on purpose"));
        }
        Ok(payload.value)
    }

    fn execute(
        &self,
        item: &ItemRequest,
        payload: &Payload,
        setups: &SetupValues<serde_json::Value>,
    ) -> ExecutionReport {
        let payload: ItemPayload = match parse_payload(payload) {
            Ok(payload) => payload,
            Err(message) => return ExecutionReport::new(ItemStatus::Errored).with_message(message),
        };
        if let Some(path) = &payload.record
            && let Err(message) = record(path, item.id.as_str())
        {
            return ExecutionReport::new(ItemStatus::Errored).with_message(message);
        }

        match payload.action {
            ItemAction::Pass => ExecutionReport::new(ItemStatus::Passed),
            ItemAction::Fail { message } => ExecutionReport::new(ItemStatus::Failed)
                .with_message(message.unwrap_or_else(|| "assertion failed".to_owned())),
            ItemAction::Error => {
                ExecutionReport::new(ItemStatus::Errored).with_message("could not run item")
            }
            ItemAction::Sleep { ms } => {
                std::thread::sleep(Duration::from_millis(ms));
                ExecutionReport::new(ItemStatus::Passed)
            }
            ItemAction::Exit { code } => std::process::exit(code),
            ItemAction::CrashOnce { marker } => {
                if marker.exists() {
                    ExecutionReport::new(ItemStatus::Passed)
                } else {
                    if let Err(err) = std::fs::write(&marker, b"") {
                        return ExecutionReport::new(ItemStatus::Errored)
                            .with_message(format!("failed to write {marker}: {err}"));
                    }
                    std::process::exit(101)
                }
            }
            ItemAction::FailUntil { counter, passes_on } => match bump_counter(&counter) {
                Ok(count) if count >= passes_on => ExecutionReport::new(ItemStatus::Passed),
                Ok(count) => ExecutionReport::new(ItemStatus::Failed)
                    .with_message(format!("run {count} of {passes_on}")),
                Err(message) => ExecutionReport::new(ItemStatus::Errored).with_message(message),
            },
            ItemAction::ExpectSetup { name, value } => match setups.get(&name) {
                Some(actual) if *actual == value => ExecutionReport::new(ItemStatus::Passed),
                Some(actual) => ExecutionReport::new(ItemStatus::Failed)
                    .with_message(format!("setup `{name}` is {actual}, expected {value}")),
                None => ExecutionReport::new(ItemStatus::Failed)
                    .with_message(format!("setup `{name}` was not provided")),
            },
        }
    }

    fn diagnostics(&self) -> Option<String> {
        Some("fixture worker".to_owned())
    }
}

fn parse_payload<T: DeserializeOwned>(payload: &Payload) -> Result<T, String> {
    serde_json::from_value(payload.as_value().clone()).map_err(|err| format!("bad payload: {err}"))
}

fn parse_or_default<T: DeserializeOwned + Default>(payload: &Payload) -> Result<T, String> {
    if payload.as_value().is_null() {
        return Ok(T::default());
    }
    parse_payload(payload)
}

fn record(path: &Utf8Path, name: &str) -> Result<(), String> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("failed to open {path}: {err}"))?;
    writeln!(file, "{name} {}", std::process::id())
        .map_err(|err| format!("failed to write {path}: {err}"))
}

fn bump_counter(path: &Utf8Path) -> Result<u32, String> {
    let count = match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("bad counter in {path}: {err}"))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(format!("failed to read {path}: {err}")),
    };
    let count = count + 1;
    std::fs::write(path, count.to_string())
        .map_err(|err| format!("failed to write {path}: {err}"))?;
    Ok(count)
}

fn main() -> ExitCode {
    match std::env::var(STARTUP_ENV).as_deref() {
        Ok("exit") => return ExitCode::from(3),
        Ok("hang") => {
            std::thread::sleep(Duration::from_secs(600));
            return ExitCode::from(3);
        }
        Ok(mode) => {
            if let Some(marker) = mode.strip_prefix("exit-once:")
                && !Utf8Path::new(marker).exists()
            {
                let _ = std::fs::write(marker, b"");
                return ExitCode::from(3);
            }
        }
        Err(_) => {}
    }

    match serve(FixtureHandler) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fixture-worker: {err}");
            ExitCode::FAILURE
        }
    }
}
