// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result, TestpoolExitCode},
    manifest::TestManifest,
    output::{OutputContext, OutputOpts, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use std::{
    io::{BufWriter, Write},
    time::Duration,
};
use testpool_runner::{
    config::{MemoryThreshold, PoolConfig, PoolProfile, RetryPolicy, WorkerCount},
    list::{StatusCache, StatusCacheStore},
    reporter::ReporterBuilder,
    runner::TestRunnerBuilder,
    worker::{CommandHandler, LOG_DIR_ENV, WorkerCommand, serve},
};
use tracing::{debug, warn};

/// The hidden subcommand workers are launched with.
const WORKER_SUBCOMMAND: &str = "__worker";

/// Runs independent test items across a pool of disposable worker processes.
#[derive(Debug, Parser)]
#[command(version, name = "testpool", styles = clap_styles())]
pub struct TestpoolApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl TestpoolApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code on success.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Run(opts) => opts.exec(output),
            Command::Worker => exec_worker(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the items in a manifest
    ///
    /// Items and setups are read from a JSON manifest and run across a pool of worker processes.
    /// Each item and setup payload is a command line (`{ "command": [...], "env": {...} }`); an
    /// item passes if its command exits with status 0.
    Run(RunOpts),

    /// Serve items as a worker process
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker,
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Path to the JSON manifest listing items and setups
    #[arg(long, short = 'm', value_name = "PATH")]
    manifest: Utf8PathBuf,

    /// Profile to use
    #[arg(long, short = 'P', env = "TESTPOOL_PROFILE")]
    profile: Option<String>,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(flatten)]
    runner_opts: TestRunnerOpts,
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "CONFIG OPTIONS")]
struct ConfigOpts {
    /// Workspace root [default: current directory]
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<Utf8PathBuf>,

    /// Config file [default: workspace-root/.config/testpool.toml]
    #[arg(long, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    fn workspace_root(&self) -> Result<Utf8PathBuf> {
        match &self.workspace_root {
            Some(root) => Ok(root.clone()),
            None => {
                let current_dir = std::env::current_dir()
                    .map_err(|err| ExpectedError::WorkspaceRootInvalid { err })?;
                Utf8PathBuf::try_from(current_dir).map_err(|err| {
                    ExpectedError::WorkspaceRootInvalid {
                        err: err.into_io_error(),
                    }
                })
            }
        }
    }

    fn make_config(&self, workspace_root: &Utf8Path) -> Result<PoolConfig> {
        Ok(PoolConfig::from_sources(
            workspace_root,
            self.config_file.as_deref(),
        )?)
    }
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "RUNNER OPTIONS")]
struct TestRunnerOpts {
    /// Number of worker processes [default: from profile]
    #[arg(
        long,
        short = 'j',
        value_name = "N",
        allow_hyphen_values = true,
        env = "TESTPOOL_WORKERS"
    )]
    workers: Option<WorkerCount>,

    /// Concurrency hint passed to each worker [default: from profile]
    #[arg(long, value_name = "N")]
    worker_threads: Option<usize>,

    /// Number of retries for failing items [default: from profile]
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Time limit for each attempt, e.g. "30s" [default: from profile]
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Replace a worker before dispatch when more than this fraction of system memory is in use
    #[arg(long, value_name = "FRACTION")]
    memory_threshold: Option<MemoryThreshold>,

    /// Cancel the run on the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Run all items regardless of failure
    #[arg(long, overrides_with = "fail_fast")]
    no_fail_fast: bool,

    /// Run items in discovery order, ignoring previous failures
    #[arg(long)]
    no_failures_first: bool,

    /// Set an environment variable for every worker
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    worker_env: Vec<(String, String)>,

    /// Write item logs to this directory instead of returning them inline
    #[arg(long, value_name = "DIR")]
    log_dir: Option<Utf8PathBuf>,
}

impl TestRunnerOpts {
    fn to_builder(&self, profile: &PoolProfile) -> TestRunnerBuilder {
        let mut builder = TestRunnerBuilder::default();
        if let Some(workers) = self.workers {
            builder.set_workers(workers);
        }
        if let Some(worker_threads) = self.worker_threads {
            builder.set_worker_threads(worker_threads);
        }
        if let Some(retries) = self.retry_override(profile.retries()) {
            builder.set_retries(retries);
        }
        if let Some(timeout) = self.timeout {
            builder.set_timeout(timeout);
        }
        if let Some(threshold) = self.memory_threshold {
            builder.set_memory_threshold(threshold);
        }
        if self.no_fail_fast {
            builder.set_fail_fast(false);
        } else if self.fail_fast {
            builder.set_fail_fast(true);
        }
        if self.no_failures_first {
            builder.set_failures_first(false);
        }
        for (key, value) in &self.worker_env {
            builder.add_worker_env(key, value);
        }
        if let Some(log_dir) = &self.log_dir {
            builder.add_worker_env(LOG_DIR_ENV, log_dir.as_str());
        }
        builder.set_handle_signals(true);
        builder
    }

    /// `--retries` only replaces the count. The profile's backoff is kept.
    fn retry_override(&self, profile_retries: RetryPolicy) -> Option<RetryPolicy> {
        self.retries.map(|count| profile_retries.with_count(count))
    }
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32> {
        let workspace_root = self.config_opts.workspace_root()?;
        let config = self.config_opts.make_config(&workspace_root)?;
        let profile = config.profile(
            self.profile
                .as_deref()
                .unwrap_or(PoolConfig::DEFAULT_PROFILE),
        )?;
        let store_dir = profile.store_dir();
        std::fs::create_dir_all(store_dir).map_err(|err| ExpectedError::StoreDirCreateError {
            store_dir: store_dir.to_owned(),
            err,
        })?;

        let test_list = TestManifest::from_path(&self.manifest)?.into_test_list()?;

        let cache_store = StatusCacheStore::at_path(profile.status_cache_path());
        let mut status_cache = match cache_store.load() {
            Ok(cache) => cache,
            Err(err) => {
                warn!("ignoring status cache: {err}");
                StatusCache::default()
            }
        };
        debug!(
            path = %cache_store.path(),
            entries = status_cache.len(),
            "loaded status cache"
        );

        let mut builder = self.runner_opts.to_builder(&profile);
        builder.set_status_cache(status_cache.clone());
        let runner = builder.build(&test_list, &profile, worker_command()?)?;

        let mut reporter = ReporterBuilder::default()
            .set_verbose(output.verbose)
            .build();
        if output.color.should_colorize(supports_color::Stream::Stderr) {
            reporter.colorize();
        }

        let mut writer = BufWriter::new(std::io::stderr());
        let mut write_error = None;
        let summary = runner.execute(|event| {
            if write_error.is_some() {
                return;
            }
            // Write and flush the event.
            if let Err(err) = reporter
                .report_event(&event, &mut writer)
                .and_then(|()| writer.flush())
            {
                write_error = Some(err);
            }
        })?;

        summary.update_status_cache(&mut status_cache);
        if let Err(err) = cache_store.save(&status_cache) {
            warn!("failed to save status cache: {err}");
        }

        if let Some(err) = write_error {
            return Err(ExpectedError::WriteEventError { err });
        }
        if !summary.stats.is_success() {
            return Err(ExpectedError::TestRunFailed);
        }
        Ok(TestpoolExitCode::OK)
    }
}

fn worker_command() -> Result<WorkerCommand> {
    let current_exe =
        std::env::current_exe().map_err(|err| ExpectedError::CurrentExeError { err })?;
    Ok(WorkerCommand::new(current_exe).arg(WORKER_SUBCOMMAND))
}

fn exec_worker() -> Result<i32> {
    serve(CommandHandler::from_env())?;
    Ok(TestpoolExitCode::OK)
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{input}`")),
    }
}
