// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-worker dispatch loops.
//!
//! Each loop owns one worker slot. It claims items from the shared queue, runs every attempt of
//! an item on its own worker, and replaces the worker whenever it dies, hangs or memory runs low.
//! Loops share nothing else apart from the cancellation flag and the event channel.

use super::backoff::BackoffIter;
use crate::{
    config::{MemoryThreshold, RetryPolicy},
    errors::{CallError, ProtocolError, SetupError},
    list::{ItemId, Payload, TestInstance, TestList},
    reporter::events::{
        Attempt, AttemptOutcome, CancelReason, FinalStatus, NotRunReason, RunEventKind,
    },
    time::stopwatch,
    worker::{
        CallContext, CallResult, ExecutionReport, ItemStatus, MemoryMonitor, SetupHandle,
        SetupRef, TerminateReason, Worker, WorkerId, WorkerOptions,
    },
};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};

/// How long a timed-out worker gets to answer a diagnostics call.
const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings that apply to every item, after profile values and overrides are merged.
#[derive(Clone, Debug)]
pub(super) struct DispatchSettings {
    pub(super) retries: RetryPolicy,
    pub(super) timeout: Duration,
    pub(super) memory_threshold: MemoryThreshold,
    pub(super) fail_fast: bool,
    pub(super) diagnostics_on_timeout: bool,
    pub(super) close_timeout: Duration,
}

#[derive(Debug, Default)]
struct ClaimState {
    next: usize,
    cancelled: Option<CancelReason>,
}

/// State shared by all dispatch loops of a run.
#[derive(Debug)]
pub(super) struct DispatchContext {
    test_list: TestList,
    queue: Vec<Arc<TestInstance>>,
    claim: Mutex<ClaimState>,
    settings: DispatchSettings,
    worker_options: WorkerOptions,
    memory_monitor: Arc<dyn MemoryMonitor>,
    next_worker_id: AtomicUsize,
    live_workers: Mutex<BTreeMap<WorkerId, Worker>>,
    terminating: AtomicBool,
    event_tx: UnboundedSender<RunEventKind>,
}

impl DispatchContext {
    pub(super) fn new(
        test_list: TestList,
        queue: Vec<Arc<TestInstance>>,
        settings: DispatchSettings,
        worker_options: WorkerOptions,
        memory_monitor: Arc<dyn MemoryMonitor>,
        first_replacement_id: usize,
        event_tx: UnboundedSender<RunEventKind>,
    ) -> Self {
        Self {
            test_list,
            queue,
            claim: Mutex::new(ClaimState::default()),
            settings,
            worker_options,
            memory_monitor,
            next_worker_id: AtomicUsize::new(first_replacement_id),
            live_workers: Mutex::new(BTreeMap::new()),
            terminating: AtomicBool::new(false),
            event_tx,
        }
    }

    /// Claims the next item, or returns `None` if the queue is exhausted or the run is cancelled.
    fn claim(&self) -> Option<Arc<TestInstance>> {
        let mut claim = self.lock_claim();
        if claim.cancelled.is_some() {
            return None;
        }
        let instance = self.queue.get(claim.next)?.clone();
        claim.next += 1;
        Some(instance)
    }

    /// Returns true once running items are being terminated.
    pub(super) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub(super) fn cancelled(&self) -> Option<CancelReason> {
        self.lock_claim().cancelled
    }

    /// Returns the items that were never claimed.
    pub(super) fn unclaimed(&self) -> &[Arc<TestInstance>] {
        let next = self.lock_claim().next;
        &self.queue[next.min(self.queue.len())..]
    }

    /// Stops new claims.
    ///
    /// A cancellation only has an effect if its reason is more severe than any earlier one;
    /// returns true in that case.
    pub(super) fn cancel(&self, reason: CancelReason, item: Option<ItemId>) -> bool {
        {
            let mut claim = self.lock_claim();
            if claim.cancelled >= Some(reason) {
                return false;
            }
            claim.cancelled = Some(reason);
        }
        let consequence = match reason {
            CancelReason::SecondSignal => "running items will be terminated",
            _ => "running items will finish",
        };
        match &item {
            Some(item) => warn!(
                %item,
                "cancelling run due to {}, {consequence}",
                reason.to_static_str()
            ),
            None => warn!(
                "cancelling run due to {}, {consequence}",
                reason.to_static_str()
            ),
        }
        self.send(RunEventKind::RunCancelled { reason, item });
        true
    }

    /// Cancels the run and terminates every running worker. Items running on them are not
    /// retried, and no replacement workers are started.
    pub(super) async fn terminate_running(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.cancel(CancelReason::SecondSignal, None);
        self.terminate_all(TerminateReason::Interrupted).await;
    }

    fn send(&self, kind: RunEventKind) {
        // The receiver lives as long as the run.
        _ = self.event_tx.send(kind);
    }

    /// Registers a worker started before dispatch began.
    pub(super) fn register(&self, worker: &Worker) {
        self.lock_live_workers().insert(worker.id(), worker.clone());
    }

    fn unregister(&self, worker: &Worker) {
        self.lock_live_workers().remove(&worker.id());
    }

    /// Terminates every worker still running. Used when the run is aborted.
    pub(super) async fn terminate_all(&self, reason: TerminateReason) {
        let workers: Vec<_> = std::mem::take(&mut *self.lock_live_workers())
            .into_values()
            .collect();
        let terminating = workers
            .iter()
            .map(|worker| worker.terminate(reason.clone()));
        futures::future::join_all(terminating).await;
    }

    /// Terminates `old` if it's still running and starts a worker to take its place.
    ///
    /// Returns `None` if the new worker could not be started.
    async fn replace(&self, old: &Worker, reason: TerminateReason) -> Option<Worker> {
        old.terminate(reason).await;
        self.unregister(old);
        let reason = old
            .termination_reason()
            .unwrap_or(TerminateReason::SocketClosed);

        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::SeqCst));
        match Worker::robust_start(id, &self.worker_options).await {
            Ok(worker) => {
                self.register(&worker);
                // Raced with terminate_running, which may not have seen this worker.
                if self.is_terminating() {
                    worker.terminate(TerminateReason::Interrupted).await;
                    self.unregister(&worker);
                    return None;
                }
                debug!(old = %old.id(), new = %id, %reason, "replaced worker");
                self.send(RunEventKind::WorkerReplaced {
                    old: old.id(),
                    reason,
                    new: id,
                    pid: worker.pid(),
                });
                Some(worker)
            }
            Err(error) => {
                warn!(old = %old.id(), new = %id, %error, "failed to start replacement worker");
                self.send(RunEventKind::WorkerStartFailed {
                    worker: id,
                    replacing: Some(old.id()),
                    error: Arc::new(error),
                });
                None
            }
        }
    }

    /// Makes sure the slot holds a live worker with memory to spare, replacing it if not.
    async fn ensure_worker(&self, slot: &mut Option<Worker>) -> Option<Worker> {
        if self.is_terminating() {
            return None;
        }
        let current = slot.as_ref()?;
        let reason = if !current.is_connected() {
            Some(
                current
                    .termination_reason()
                    .unwrap_or(TerminateReason::SocketClosed),
            )
        } else if self.memory_exceeded() {
            Some(TerminateReason::MemoryPressure)
        } else {
            None
        };

        if let Some(reason) = reason {
            let old = slot.take()?;
            *slot = self.replace(&old, reason).await;
        }
        slot.clone()
    }

    fn memory_exceeded(&self) -> bool {
        let threshold = self.settings.memory_threshold;
        if threshold == MemoryThreshold::DISABLED {
            return false;
        }
        match self.memory_monitor.used_fraction() {
            Some(used) if threshold.is_exceeded_by(used) => {
                debug!(
                    used,
                    threshold = threshold.fraction(),
                    "memory usage over threshold"
                );
                true
            }
            _ => false,
        }
    }

    fn lock_claim(&self) -> std::sync::MutexGuard<'_, ClaimState> {
        self.claim.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_live_workers(&self) -> std::sync::MutexGuard<'_, BTreeMap<WorkerId, Worker>> {
        self.live_workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Runs items on one worker slot until the queue is exhausted, the run is cancelled, or no
/// worker can be started for the slot.
///
/// Returns an error only for protocol violations, which abort the run.
pub(super) async fn dispatch_loop(
    ctx: Arc<DispatchContext>,
    worker: Worker,
) -> Result<(), ProtocolError> {
    let mut slot = Some(worker);
    while slot.is_some() {
        let Some(instance) = ctx.claim() else {
            break;
        };
        run_item(&ctx, &mut slot, instance).await?;
    }

    if let Some(worker) = slot {
        worker.close(ctx.settings.close_timeout).await;
        ctx.unregister(&worker);
    }
    Ok(())
}

#[instrument(level = "debug", skip_all, fields(item = %instance.id()))]
async fn run_item(
    ctx: &DispatchContext,
    slot: &mut Option<Worker>,
    instance: Arc<TestInstance>,
) -> Result<(), ProtocolError> {
    let item = &instance.item;
    let retries = ctx.settings.retries.count_for_item(item.retries);
    let total_attempts = retries + 1;
    let fail_fast = item.failfast.unwrap_or(ctx.settings.fail_fast);
    let timeout = item.timeout.unwrap_or(ctx.settings.timeout);
    let mut backoff = BackoffIter::new(ctx.settings.retries, retries);
    let mut last_outcome = None;
    let mut attempt_count = 0;

    for number in 1..=total_attempts {
        let Some(worker) = ctx.ensure_worker(slot).await else {
            break;
        };

        ctx.send(RunEventKind::AttemptStarted {
            instance: instance.clone(),
            attempt: number,
            total_attempts,
            worker: worker.id(),
        });
        let attempt = run_attempt(ctx, &worker, &instance, number, timeout).await?;
        let outcome = attempt.outcome;
        last_outcome = Some(outcome);
        attempt_count += 1;

        // Cancellation only stops new claims: a claimed item keeps its whole retry budget,
        // unless running items are being terminated.
        let last = outcome.is_success() || number == total_attempts || ctx.is_terminating();
        let will_retry = if last { None } else { backoff.next() };
        ctx.send(RunEventKind::AttemptFinished {
            instance: instance.clone(),
            attempt,
            total_attempts,
            will_retry,
        });

        match will_retry {
            Some(delay) => {
                debug!(attempt = number, ?delay, "retrying item");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            None => break,
        }
    }

    let status = match last_outcome {
        Some(outcome) => FinalStatus::Finished(outcome),
        None if ctx.is_terminating() => FinalStatus::NotRun(NotRunReason::Cancelled),
        None => FinalStatus::NotRun(NotRunReason::NoWorkers),
    };
    ctx.send(RunEventKind::ItemFinished {
        instance: instance.clone(),
        status,
        attempt_count,
    });
    if fail_fast && matches!(status, FinalStatus::Finished(outcome) if !outcome.is_success()) {
        ctx.cancel(CancelReason::TestFailure, Some(instance.id().clone()));
    }
    Ok(())
}

enum AttemptError {
    Setup(SetupError),
    Call(CallError),
}

async fn run_attempt(
    ctx: &DispatchContext,
    worker: &Worker,
    instance: &TestInstance,
    number: u32,
    timeout: Duration,
) -> Result<Attempt, ProtocolError> {
    let start = stopwatch();
    let result = tokio::time::timeout(timeout, execute_on(ctx, worker, instance, number)).await;

    let (outcome, message, report) = match result {
        Ok(Ok(report)) => {
            let outcome = match report.status {
                ItemStatus::Passed => AttemptOutcome::Passed,
                ItemStatus::Failed => AttemptOutcome::Failed,
                ItemStatus::Errored => AttemptOutcome::Errored,
            };
            (outcome, report.message.clone(), Some(report))
        }
        Ok(Err(AttemptError::Setup(SetupError::Interrupted {
            error: CallError::Protocol(error),
            ..
        })))
        | Ok(Err(AttemptError::Call(CallError::Protocol(error)))) => return Err(error),
        Ok(Err(AttemptError::Setup(error @ SetupError::Evaluation { .. }))) => {
            (AttemptOutcome::Errored, Some(error.to_string()), None)
        }
        Ok(Err(AttemptError::Call(CallError::Remote { message }))) => {
            (AttemptOutcome::Errored, Some(message), None)
        }
        Ok(Err(AttemptError::Setup(SetupError::Interrupted { .. })))
        | Ok(Err(AttemptError::Call(CallError::WorkerTerminated { .. }))) => {
            // Wait for the worker to finish going away so its exit status is known.
            worker.terminate(TerminateReason::SocketClosed).await;
            (AttemptOutcome::Crashed, Some(crash_message(worker)), None)
        }
        Err(_elapsed) => {
            let mut message = format!("timed out after {}", humantime::format_duration(timeout));
            if ctx.settings.diagnostics_on_timeout
                && let Some(report) = collect_diagnostics(worker).await
            {
                _ = write!(message, "\n\nworker diagnostics:\n{}", report.trim_end());
            }
            worker.terminate(TerminateReason::Timeout).await;
            (AttemptOutcome::TimedOut, Some(message), None)
        }
    };

    let snapshot = start.snapshot();
    let (stats, log) = match report {
        Some(report) => (report.stats, report.log),
        None => Default::default(),
    };
    Ok(Attempt {
        number,
        outcome,
        message,
        worker: worker.id(),
        start_time: snapshot.start_time,
        duration: snapshot.duration,
        stats,
        log,
    })
}

async fn execute_on(
    ctx: &DispatchContext,
    worker: &Worker,
    instance: &TestInstance,
    number: u32,
) -> Result<ExecutionReport, AttemptError> {
    let item = &instance.item;
    let mut setups = Vec::with_capacity(item.setups.len());
    for name in &item.setups {
        let handle = worker
            .setup_cache()
            .resolve(name, || evaluate_setup(ctx, worker, name))
            .await
            .map_err(AttemptError::Setup)?;
        setups.push(SetupRef {
            name: name.clone(),
            handle,
        });
    }

    let call = worker.call(
        CallContext::Execute {
            item_id: item.id.clone(),
            name: item.name.clone(),
            attempt: number,
            setups,
        },
        item.payload.clone(),
    );
    let request_id = call.request_id();
    match call.await.map_err(AttemptError::Call)? {
        CallResult::Executed(report) => Ok(report),
        other => Err(AttemptError::Call(CallError::Protocol(
            ProtocolError::UnexpectedResult {
                request_id,
                expected: "executed",
                actual: other.kind(),
            },
        ))),
    }
}

async fn evaluate_setup(
    ctx: &DispatchContext,
    worker: &Worker,
    name: &str,
) -> Result<SetupHandle, SetupError> {
    let declared = ctx.test_list.setup(name);
    let payload = declared.map_or_else(Payload::null, |setup| setup.payload.clone());
    debug!(worker = %worker.id(), setup = name, "evaluating setup");

    let call = worker.call(
        CallContext::EvaluateSetup {
            name: name.to_owned(),
            declared: declared.is_some(),
        },
        payload,
    );
    let request_id = call.request_id();
    match call.await {
        Ok(CallResult::SetupEvaluated { handle }) => Ok(handle),
        Ok(other) => Err(SetupError::Interrupted {
            name: name.to_owned(),
            error: CallError::Protocol(ProtocolError::UnexpectedResult {
                request_id,
                expected: "setup-evaluated",
                actual: other.kind(),
            }),
        }),
        Err(CallError::Remote { message }) => Err(SetupError::Evaluation {
            name: name.to_owned(),
            source_location: declared
                .and_then(|setup| setup.source.as_ref())
                .map(|source| source.to_string()),
            message,
        }),
        Err(error) => Err(SetupError::Interrupted {
            name: name.to_owned(),
            error,
        }),
    }
}

async fn collect_diagnostics(worker: &Worker) -> Option<String> {
    let call = worker.call(CallContext::Diagnostics, Payload::null());
    match tokio::time::timeout(DIAGNOSTICS_TIMEOUT, call).await {
        Ok(Ok(CallResult::Diagnostics { report })) => Some(report),
        Ok(Ok(other)) => {
            debug!(worker = %worker.id(), result = other.kind(), "unexpected diagnostics result");
            None
        }
        Ok(Err(error)) => {
            debug!(worker = %worker.id(), %error, "diagnostics call failed");
            None
        }
        Err(_) => {
            debug!(worker = %worker.id(), "worker did not answer diagnostics call");
            None
        }
    }
}

fn crash_message(worker: &Worker) -> String {
    let mut message = match (worker.exit_status(), worker.termination_reason()) {
        (_, Some(reason @ TerminateReason::Interrupted)) => {
            format!("worker {} (pid {}): {reason}", worker.id(), worker.pid())
        }
        (Some(exit), _) => format!("worker {} (pid {}) {exit}", worker.id(), worker.pid()),
        (None, Some(reason)) => format!("worker {} (pid {}): {reason}", worker.id(), worker.pid()),
        (None, None) => format!("worker {} (pid {}) went away", worker.id(), worker.pid()),
    };
    let tail = worker.output_tail();
    if !tail.is_empty() {
        message.push_str("\n\nlast worker output:");
        for line in tail {
            _ = write!(message, "\n  {line}");
        }
    }
    message
}
