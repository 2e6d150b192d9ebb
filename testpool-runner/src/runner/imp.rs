// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::dispatch::{DispatchContext, DispatchSettings, dispatch_loop};
use crate::{
    config::{MemoryThreshold, PoolProfile, RetryPolicy, WorkerCount},
    errors::{ProtocolError, TestRunnerBuildError, TestRunnerExecuteError},
    helpers::panic_message,
    list::{Payload, StatusCache, TestInstance, TestList},
    reporter::events::{
        Attempt, CancelReason, FinalStatus, ItemResult, NotRunReason, RunEvent, RunEventKind,
        RunId, RunStats, RunSummary,
    },
    time::{StopwatchStart, stopwatch},
    worker::{
        MemoryMonitor, RUN_ID_ENV, SystemMemory, TerminateReason, Worker, WorkerCommand, WorkerId,
        WorkerOptions,
    },
};
use chrono::Local;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    runtime::Runtime,
    sync::mpsc::unbounded_channel,
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, warn};

/// How long a worker gets to acknowledge a shutdown request at the end of a run.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Test runner options.
///
/// Every setting defaults to the profile's value; a setting made here wins over the profile.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    workers: Option<WorkerCount>,
    worker_threads: Option<usize>,
    retries: Option<RetryPolicy>,
    timeout: Option<Duration>,
    memory_threshold: Option<MemoryThreshold>,
    fail_fast: Option<bool>,
    failures_first: Option<bool>,
    diagnostics_on_timeout: Option<bool>,
    status_cache: Option<StatusCache>,
    memory_monitor: Option<Arc<dyn MemoryMonitor>>,
    worker_env: BTreeMap<String, String>,
    handle_signals: bool,
}

impl TestRunnerBuilder {
    /// Sets the number of workers.
    pub fn set_workers(&mut self, workers: WorkerCount) -> &mut Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the concurrency hint passed to each worker.
    pub fn set_worker_threads(&mut self, worker_threads: usize) -> &mut Self {
        self.worker_threads = Some(worker_threads.max(1));
        self
    }

    /// Sets the retry policy.
    pub fn set_retries(&mut self, retries: RetryPolicy) -> &mut Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the per-item timeout used when an item doesn't set its own.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the memory threshold above which workers are replaced before dispatch.
    pub fn set_memory_threshold(&mut self, threshold: MemoryThreshold) -> &mut Self {
        self.memory_threshold = Some(threshold);
        self
    }

    /// Sets whether the run stops claiming items after the first item that doesn't pass.
    pub fn set_fail_fast(&mut self, fail_fast: bool) -> &mut Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// Sets whether items that failed last time are dispatched first.
    pub fn set_failures_first(&mut self, failures_first: bool) -> &mut Self {
        self.failures_first = Some(failures_first);
        self
    }

    /// Sets whether timed-out workers are asked for diagnostics before being terminated.
    pub fn set_diagnostics_on_timeout(&mut self, diagnostics: bool) -> &mut Self {
        self.diagnostics_on_timeout = Some(diagnostics);
        self
    }

    /// Sets the outcomes of a previous run, used for failures-first ordering.
    pub fn set_status_cache(&mut self, cache: StatusCache) -> &mut Self {
        self.status_cache = Some(cache);
        self
    }

    /// Sets the source of system memory usage. Defaults to [`SystemMemory`].
    pub fn set_memory_monitor(&mut self, monitor: Arc<dyn MemoryMonitor>) -> &mut Self {
        self.memory_monitor = Some(monitor);
        self
    }

    /// Adds an environment variable for every worker process.
    pub fn add_worker_env(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.worker_env.insert(key.into(), value.into());
        self
    }

    /// If set, an interrupt (Ctrl-C) cancels the run the same way fail-fast does. A second
    /// interrupt terminates the items that are still running.
    pub fn set_handle_signals(&mut self, handle_signals: bool) -> &mut Self {
        self.handle_signals = handle_signals;
        self
    }

    /// Creates a new test runner.
    ///
    /// Workers are launched with `command`, which must start a process that speaks the worker
    /// protocol.
    pub fn build(
        self,
        test_list: &TestList,
        profile: &PoolProfile,
        command: WorkerCommand,
    ) -> Result<TestRunner, TestRunnerBuildError> {
        let run_id = RunId::new_v4();
        let worker_count = self
            .workers
            .unwrap_or_else(|| profile.workers())
            .compute()
            .min(test_list.len());

        let failures_first = self
            .failures_first
            .unwrap_or_else(|| profile.failures_first());
        let queue = match (&self.status_cache, failures_first) {
            (Some(cache), true) => test_list.ordered(Some(cache)),
            _ => test_list.ordered(None),
        };

        let command = command
            .envs(self.worker_env)
            .env(RUN_ID_ENV, run_id.to_string());
        let mut worker_options = WorkerOptions::new(command);
        worker_options.threads = self
            .worker_threads
            .unwrap_or_else(|| profile.worker_threads());
        worker_options.connect_timeout = profile.connect_timeout();
        worker_options.grace_period = profile.terminate_grace_period();
        worker_options.startup_hook = profile.startup_hook().cloned().map(Payload::new);

        let settings = DispatchSettings {
            retries: self.retries.unwrap_or_else(|| profile.retries()),
            timeout: self.timeout.unwrap_or_else(|| profile.timeout()),
            memory_threshold: self
                .memory_threshold
                .unwrap_or_else(|| profile.memory_threshold()),
            fail_fast: self.fail_fast.unwrap_or_else(|| profile.fail_fast()),
            diagnostics_on_timeout: self
                .diagnostics_on_timeout
                .unwrap_or_else(|| profile.diagnostics_on_timeout()),
            close_timeout: CLOSE_TIMEOUT,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testpool-runner")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                run_id,
                profile_name: profile.name().to_owned(),
                test_list: test_list.clone(),
                queue,
                worker_count,
                worker_options,
                settings,
                memory_monitor: self
                    .memory_monitor
                    .unwrap_or_else(|| Arc::new(SystemMemory)),
                handle_signals: self.handle_signals,
            },
            runtime,
        })
    }
}

/// Context for running items.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    inner: TestRunnerInner,
    runtime: Runtime,
}

impl TestRunner {
    /// Returns the ID of the run.
    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    /// Returns the number of workers that will be started.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Returns the items in the order they will be claimed.
    pub fn queue(&self) -> &[Arc<TestInstance>] {
        &self.inner.queue
    }

    /// Executes the listed items across the worker pool.
    ///
    /// The callback is called with each event as it happens. Returns the summary of the run, or an
    /// error if the run was aborted: no worker could be started, a worker broke the protocol, or
    /// a dispatch loop panicked.
    pub fn execute<F>(self, mut callback: F) -> Result<RunSummary, TestRunnerExecuteError>
    where
        F: FnMut(RunEvent),
    {
        let Self { inner, runtime } = self;
        let result = runtime.block_on(inner.execute(&mut callback));
        // Loops close their own workers. After an abort, whatever is left is killed on drop.
        runtime.shutdown_timeout(Duration::from_secs(1));
        result
    }
}

#[derive(Debug)]
struct TestRunnerInner {
    run_id: RunId,
    profile_name: String,
    test_list: TestList,
    queue: Vec<Arc<TestInstance>>,
    worker_count: usize,
    worker_options: WorkerOptions,
    settings: DispatchSettings,
    memory_monitor: Arc<dyn MemoryMonitor>,
    handle_signals: bool,
}

impl TestRunnerInner {
    async fn execute(
        self,
        callback: &mut dyn FnMut(RunEvent),
    ) -> Result<RunSummary, TestRunnerExecuteError> {
        let mut aggregator = Aggregator::new(self.run_id, &self.test_list, callback);
        aggregator.handle(RunEventKind::RunStarted {
            run_id: self.run_id,
            profile_name: self.profile_name.clone(),
            item_count: self.queue.len(),
            worker_count: self.worker_count,
        });
        if self.queue.is_empty() {
            return Ok(aggregator.finish());
        }

        let workers = self.start_workers(&mut aggregator).await?;

        let (event_tx, mut event_rx) = unbounded_channel();
        let ctx = Arc::new(DispatchContext::new(
            self.test_list,
            self.queue,
            self.settings,
            self.worker_options,
            self.memory_monitor,
            self.worker_count,
            event_tx,
        ));

        let mut loops = JoinSet::new();
        for worker in workers {
            ctx.register(&worker);
            loops.spawn(dispatch_loop(ctx.clone(), worker));
        }

        let signal_task = self
            .handle_signals
            .then(|| tokio::spawn(handle_interrupts(ctx.clone())));

        let mut fatal = None;
        while !loops.is_empty() {
            tokio::select! {
                biased;

                Some(kind) = event_rx.recv() => aggregator.handle(kind),
                Some(joined) = loops.join_next() => {
                    if let Some(err) = loop_error(joined) {
                        error!("aborting run: {err}");
                        if fatal.is_none() {
                            fatal = Some(err);
                            loops.abort_all();
                        }
                    }
                }
            }
        }
        if let Some(task) = signal_task {
            task.abort();
        }
        while let Ok(kind) = event_rx.try_recv() {
            aggregator.handle(kind);
        }

        if let Some(err) = fatal {
            ctx.terminate_all(TerminateReason::ProtocolViolation).await;
            return Err(err);
        }

        let reason = match ctx.cancelled() {
            Some(_) => NotRunReason::Cancelled,
            None => NotRunReason::NoWorkers,
        };
        for instance in ctx.unclaimed() {
            aggregator.handle(RunEventKind::ItemFinished {
                instance: instance.clone(),
                status: FinalStatus::NotRun(reason),
                attempt_count: 0,
            });
        }
        Ok(aggregator.finish())
    }

    async fn start_workers(
        &self,
        aggregator: &mut Aggregator<'_>,
    ) -> Result<Vec<Worker>, TestRunnerExecuteError> {
        let options = &self.worker_options;
        let results = futures::future::join_all((0..self.worker_count).map(|index| async move {
            let id = WorkerId(index);
            (id, Worker::robust_start(id, options).await)
        }))
        .await;

        let mut workers = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (id, result) in results {
            match result {
                Ok(worker) => {
                    aggregator.handle(RunEventKind::WorkerStarted {
                        worker: id,
                        pid: worker.pid(),
                    });
                    workers.push(worker);
                }
                Err(error) => {
                    warn!(worker = %id, %error, "worker failed to start");
                    let error = Arc::new(error);
                    aggregator.handle(RunEventKind::WorkerStartFailed {
                        worker: id,
                        replacing: None,
                        error: error.clone(),
                    });
                    errors.push(error);
                }
            }
        }

        if workers.is_empty() {
            return Err(TestRunnerExecuteError::NoWorkersStarted { errors });
        }
        debug!(
            started = workers.len(),
            requested = self.worker_count,
            "workers started"
        );
        Ok(workers)
    }
}

#[cfg(unix)]
async fn handle_interrupts(ctx: Arc<DispatchContext>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(error) => {
            warn!(%error, "failed to set up interrupt handler");
            return;
        }
    };
    let mut count = 0;
    while sigint.recv().await.is_some() {
        count += 1;
        on_interrupt(&ctx, count).await;
    }
}

#[cfg(not(unix))]
async fn handle_interrupts(ctx: Arc<DispatchContext>) {
    let mut count = 0;
    while tokio::signal::ctrl_c().await.is_ok() {
        count += 1;
        on_interrupt(&ctx, count).await;
    }
}

/// The first interrupt stops new claims. Any later one also terminates running items.
async fn on_interrupt(ctx: &DispatchContext, count: usize) {
    if count == 1 {
        ctx.cancel(CancelReason::Interrupt, None);
    } else {
        ctx.terminate_running().await;
    }
}

fn loop_error(
    joined: Result<Result<(), ProtocolError>, JoinError>,
) -> Option<TestRunnerExecuteError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(TestRunnerExecuteError::Protocol(error)),
        // Loops are only cancelled after another one failed.
        Err(join_error) if join_error.is_cancelled() => None,
        Err(join_error) => Some(TestRunnerExecuteError::DispatchPanicked {
            message: panic_message(&*join_error.into_panic()).to_owned(),
        }),
    }
}

/// Collects events into per-item results and forwards them to the caller.
struct Aggregator<'a> {
    run_id: RunId,
    stopwatch: StopwatchStart,
    callback: &'a mut dyn FnMut(RunEvent),
    items: Vec<ItemState>,
    stats: RunStats,
    cancelled: Option<CancelReason>,
}

struct ItemState {
    instance: Arc<TestInstance>,
    attempts: Vec<Attempt>,
    status: Option<FinalStatus>,
}

impl<'a> Aggregator<'a> {
    fn new(run_id: RunId, test_list: &TestList, callback: &'a mut dyn FnMut(RunEvent)) -> Self {
        Self {
            run_id,
            stopwatch: stopwatch(),
            callback,
            items: test_list
                .iter()
                .map(|instance| ItemState {
                    instance: instance.clone(),
                    attempts: Vec::new(),
                    status: None,
                })
                .collect(),
            stats: RunStats {
                initial_run_count: test_list.len(),
                ..RunStats::default()
            },
            cancelled: None,
        }
    }

    fn handle(&mut self, kind: RunEventKind) {
        match &kind {
            RunEventKind::WorkerStarted { .. } => self.stats.workers_started += 1,
            RunEventKind::WorkerReplaced { .. } => {
                self.stats.workers_started += 1;
                self.stats.workers_replaced += 1;
            }
            RunEventKind::AttemptFinished {
                instance, attempt, ..
            } => {
                self.stats.attempts += 1;
                if let Some(state) = self.items.get_mut(instance.sequence_number) {
                    state.attempts.push(attempt.clone());
                }
            }
            RunEventKind::ItemFinished {
                instance,
                status,
                attempt_count,
            } => {
                self.stats.on_item_finished(*status, *attempt_count);
                if let Some(state) = self.items.get_mut(instance.sequence_number) {
                    state.status = Some(*status);
                }
            }
            RunEventKind::RunCancelled { reason, .. } => {
                self.cancelled = self.cancelled.max(Some(*reason));
            }
            RunEventKind::RunStarted { .. }
            | RunEventKind::WorkerStartFailed { .. }
            | RunEventKind::AttemptStarted { .. }
            | RunEventKind::RunFinished { .. } => {}
        }

        let elapsed = self.stopwatch.snapshot().duration;
        (self.callback)(RunEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed,
            kind,
        });
    }

    fn finish(mut self) -> RunSummary {
        let snapshot = self.stopwatch.snapshot();
        self.handle(RunEventKind::RunFinished {
            run_id: self.run_id,
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
            stats: self.stats,
        });

        RunSummary {
            run_id: self.run_id,
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
            items: self
                .items
                .into_iter()
                .map(|state| ItemResult {
                    instance: state.instance,
                    attempts: state.attempts,
                    // Every item is either finished or marked not run before the summary is built.
                    status: state
                        .status
                        .unwrap_or(FinalStatus::NotRun(NotRunReason::Cancelled)),
                })
                .collect(),
            stats: self.stats,
            cancelled: self.cancelled,
        }
    }
}
