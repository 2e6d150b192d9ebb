// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [`UnitHandler`] whose items and setups are command lines.

use super::{
    ExecutionReport, ItemRequest, ItemStatus, LogHandle, ProcessExit, SetupValues, UnitHandler,
};
use crate::{
    helpers::{sanitize_file_component, tail_str},
    list::Payload,
};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    process::{Command, Output, Stdio},
};

/// Environment variable naming a directory where [`CommandHandler`] writes item logs.
///
/// If unset, logs are returned inline, truncated to their last [`INLINE_LOG_LIMIT`] bytes.
pub const LOG_DIR_ENV: &str = "TESTPOOL_LOG_DIR";

/// The most log output returned inline with an execution report.
pub const INLINE_LOG_LIMIT: usize = 16 * 1024;

/// The payload of a command item or setup.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CommandSpec {
    /// The program and its arguments.
    pub command: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// The working directory, if different from the worker's.
    #[serde(default)]
    pub cwd: Option<Utf8PathBuf>,
}

impl CommandSpec {
    fn from_payload(payload: &Payload) -> Result<Self, String> {
        serde_json::from_value(payload.as_value().clone())
            .map_err(|err| format!("invalid command payload: {err}"))
    }

    fn run(&self, extra_env: &BTreeMap<String, String>) -> Result<Output, String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "command is empty".to_owned())?;
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(extra_env)
            .envs(&self.env)
            .stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .output()
            .map_err(|err| format!("failed to run `{program}`: {err}"))
    }
}

/// The context a command setup evaluates to: the `KEY=VALUE` lines it printed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SetupEnv(pub BTreeMap<String, String>);

impl SetupEnv {
    fn parse(stdout: &str) -> Self {
        Self(
            stdout
                .lines()
                .filter_map(|line| line.split_once('='))
                .map(|(key, value)| (key.trim().to_owned(), value.to_owned()))
                .filter(|(key, _)| !key.is_empty() && !key.contains(char::is_whitespace))
                .collect(),
        )
    }
}

/// Runs items and setups as child processes of the worker.
///
/// An item passes if its command exits with status 0. The environment of setups an item depends
/// on is applied in declaration order, then the item's own environment.
#[derive(Clone, Debug, Default)]
pub struct CommandHandler {
    log_dir: Option<Utf8PathBuf>,
}

impl CommandHandler {
    /// Creates a handler that writes logs to the directory in `TESTPOOL_LOG_DIR`, if set.
    pub fn from_env() -> Self {
        Self {
            log_dir: std::env::var(LOG_DIR_ENV).ok().map(Utf8PathBuf::from),
        }
    }

    /// Creates a handler that writes logs to `log_dir`, or returns them inline if `None`.
    pub fn new(log_dir: Option<Utf8PathBuf>) -> Self {
        Self { log_dir }
    }

    fn log_handle(&self, item: &ItemRequest, output: &Output) -> LogHandle {
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Some(dir) = &self.log_dir {
            let path = dir.join(format!(
                "{}-attempt{}.log",
                sanitize_file_component(item.id.as_str()),
                item.attempt
            ));
            match std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, &log)) {
                Ok(()) => return LogHandle::File(path),
                Err(err) => {
                    tracing::warn!("failed to write log to {path}: {err}, returning it inline");
                }
            }
        }
        LogHandle::Inline(tail_str(&log, INLINE_LOG_LIMIT).to_owned())
    }
}

impl UnitHandler for CommandHandler {
    type Context = SetupEnv;

    fn evaluate_setup(&self, name: &str, payload: &Payload) -> Result<SetupEnv, String> {
        let spec = CommandSpec::from_payload(payload)?;
        let output = spec.run(&BTreeMap::new())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "setup command `{name}` {}: {}",
                ProcessExit::from_status(output.status, false),
                tail_str(stderr.trim_end(), 1024),
            ));
        }
        Ok(SetupEnv::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    fn execute(
        &self,
        item: &ItemRequest,
        payload: &Payload,
        setups: &SetupValues<SetupEnv>,
    ) -> ExecutionReport {
        let spec = match CommandSpec::from_payload(payload) {
            Ok(spec) => spec,
            Err(message) => return ExecutionReport::new(ItemStatus::Errored).with_message(message),
        };
        let mut env = BTreeMap::new();
        for (_, setup) in setups.iter() {
            env.extend(setup.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let output = match spec.run(&env) {
            Ok(output) => output,
            Err(message) => return ExecutionReport::new(ItemStatus::Errored).with_message(message),
        };
        let mut report = if output.status.success() {
            ExecutionReport::new(ItemStatus::Passed)
        } else {
            let exit = ProcessExit::from_status(output.status, false);
            ExecutionReport::new(ItemStatus::Failed).with_message(format!("command {exit}"))
        };
        report.log = Some(self.log_handle(item, &output));
        report
    }
}
