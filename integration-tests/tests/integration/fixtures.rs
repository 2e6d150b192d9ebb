// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::{Result, eyre::WrapErr};
use serde_json::{Value, json};
use std::{
    collections::BTreeSet,
    fmt,
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use testpool_runner::{
    config::{PoolConfig, PoolProfile, WorkerCount},
    errors::TestRunnerExecuteError,
    list::{TestItem, TestList, TestSetup},
    reporter::events::{RunEvent, RunEventKind, RunSummary},
    runner::TestRunnerBuilder,
    worker::WorkerCommand,
};

/// Returns a command that starts the fixture worker.
pub(crate) fn fixture_worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_fixture-worker"))
}

pub(crate) fn pass(id: &str) -> TestItem {
    TestItem::new(id, json!({ "action": "pass" }))
}

pub(crate) fn fail(id: &str) -> TestItem {
    TestItem::new(id, json!({ "action": "fail" }))
}

pub(crate) fn action(id: &str, payload: Value) -> TestItem {
    TestItem::new(id, payload)
}

pub(crate) fn setup(name: &str, payload: Value) -> TestSetup {
    TestSetup::new(name, payload)
}

/// A scratch workspace with its own config.
pub(crate) struct TempWorkspace {
    dir: Utf8TempDir,
}

impl TempWorkspace {
    /// Creates a workspace with `.config/testpool.toml` set to `config`.
    pub(crate) fn new(config: &str) -> Result<Self> {
        let dir = camino_tempfile::tempdir().wrap_err("failed to create temp dir")?;
        let config_dir = dir.path().join(".config");
        std::fs::create_dir_all(&config_dir)?;
        std::fs::write(config_dir.join("testpool.toml"), config)?;
        Ok(Self { dir })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    /// Returns a path inside the workspace.
    pub(crate) fn path(&self, name: &str) -> Utf8PathBuf {
        self.dir.path().join(name)
    }

    pub(crate) fn profile(&self, name: &str) -> Result<PoolProfile> {
        let config = PoolConfig::from_sources(self.root(), None)?;
        Ok(config.profile(name)?)
    }

    /// Reads a record file written by the fixture worker as `(name, pid)` lines.
    pub(crate) fn records(&self, name: &str) -> Result<Vec<(String, u32)>> {
        let path = self.path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).wrap_err_with(|| format!("failed to read {path}")),
        };
        contents
            .lines()
            .map(|line| -> Result<(String, u32)> {
                let (name, pid) = line
                    .rsplit_once(' ')
                    .ok_or_else(|| color_eyre::eyre::eyre!("malformed record line `{line}`"))?;
                Ok((name.to_owned(), pid.parse()?))
            })
            .collect()
    }

    /// Returns the distinct PIDs that wrote to a record file.
    pub(crate) fn record_pids(&self, name: &str) -> Result<BTreeSet<u32>> {
        let records = self.records(name)?;
        Ok(records.into_iter().map(|(_, pid)| pid).collect())
    }
}

/// A config tuned for tests: one worker, discovery order and short grace periods.
pub(crate) const FAST_CONFIG: &str = r#"
[profile.default]
workers = 1
failures-first = false
terminate-grace-period = "200ms"
memory-threshold = 1.0
"#;

/// The result of running a list to completion.
pub(crate) struct RunOutput {
    pub(crate) summary: RunSummary,
    pub(crate) events: Vec<RunEvent>,
}

impl RunOutput {
    pub(crate) fn count_events(&self, pred: impl Fn(&RunEventKind) -> bool) -> usize {
        self.events.iter().filter(|event| pred(&event.kind)).count()
    }
}

/// Runs `items` on the fixture worker, returning the execute error if the run aborted.
pub(crate) fn try_run(
    profile: &PoolProfile,
    items: Vec<TestItem>,
    setups: Vec<TestSetup>,
    configure: impl FnOnce(&mut TestRunnerBuilder),
    command: WorkerCommand,
) -> Result<Result<RunOutput, TestRunnerExecuteError>> {
    let test_list = TestList::new(items, setups)?;
    let mut builder = TestRunnerBuilder::default();
    builder.set_workers(WorkerCount::Count(1));
    configure(&mut builder);
    let runner = builder.build(&test_list, profile, command)?;

    let mut events = Vec::new();
    Ok(runner
        .execute(|event| events.push(event))
        .map(|summary| RunOutput { summary, events }))
}

/// Runs `items` on the fixture worker and returns the summary and every event.
pub(crate) fn run(
    profile: &PoolProfile,
    items: Vec<TestItem>,
    setups: Vec<TestSetup>,
    configure: impl FnOnce(&mut TestRunnerBuilder),
) -> Result<RunOutput> {
    let output = try_run(profile, items, setups, configure, fixture_worker())??;
    Ok(output)
}

pub(crate) fn item_status(
    output: &RunOutput,
    id: &str,
) -> testpool_runner::reporter::events::FinalStatus {
    output
        .summary
        .item(&id.into())
        .unwrap_or_else(|| panic!("item {id} is in the summary"))
        .status
}

pub(crate) fn short_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Runs the `testpool` binary.
#[derive(Clone, Debug)]
pub(crate) struct TestpoolCli {
    args: Vec<String>,
}

impl TestpoolCli {
    pub(crate) fn new() -> Self {
        Self {
            args: vec!["--color".to_owned(), "never".to_owned()],
        }
    }

    pub(crate) fn args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn output(&self) -> TestpoolOutput {
        let mut command = Command::new(env!("CARGO_BIN_EXE_testpool-dup"));
        command.args(&self.args);
        let output = command.output().expect("failed to execute testpool");
        TestpoolOutput {
            command,
            exit_status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Starts testpool without waiting for it to finish. Stderr is piped.
    pub(crate) fn spawn(&self) -> Result<Child> {
        Command::new(env!("CARGO_BIN_EXE_testpool-dup"))
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .wrap_err("failed to spawn testpool")
    }
}

pub(crate) struct TestpoolOutput {
    command: Command,
    pub(crate) exit_status: ExitStatus,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl TestpoolOutput {
    pub(crate) fn stderr_as_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl fmt::Display for TestpoolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command: {:?}\nexit code: {:?}\n\
                   --- stdout ---\n{}\n\n--- stderr ---\n{}\n\n",
            self.command,
            self.exit_status.code(),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

// Make Debug output the same as Display output, so `.unwrap()` and `.expect()` are nicer.
impl fmt::Debug for TestpoolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
