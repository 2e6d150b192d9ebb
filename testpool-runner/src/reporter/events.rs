// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events produced during a run, and the summary built from them.

use crate::{
    errors::WorkerStartError,
    list::{ItemId, StatusCache, TestInstance},
    worker::{LogHandle, ResourceStats, TerminateReason, WorkerId},
};
use chrono::{DateTime, FixedOffset};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// The kind for [`RunId`].
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("testpool_run");
        TAG
    }
}

/// A unique identifier for a run.
pub type RunId = TypedUuid<RunKind>;

/// How a single attempt at an item ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// The item passed.
    Passed,
    /// The item ran and failed.
    Failed,
    /// The item could not be run properly, e.g. because a setup failed.
    Errored,
    /// The item did not finish within its timeout.
    TimedOut,
    /// The worker running the item died.
    Crashed,
}

impl AttemptOutcome {
    /// Returns true if the item passed.
    pub fn is_success(self) -> bool {
        self == Self::Passed
    }

    /// Returns a short lowercase name for the outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::TimedOut => "timed out",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record of one attempt at an item.
#[derive(Clone, Debug)]
pub struct Attempt {
    /// The attempt number, starting at 1.
    pub number: u32,

    /// How the attempt ended.
    pub outcome: AttemptOutcome,

    /// An explanation of the outcome, if there is one.
    pub message: Option<String>,

    /// The worker the attempt ran on.
    pub worker: WorkerId,

    /// When the attempt started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the attempt took, as measured by the coordinator.
    pub duration: Duration,

    /// Resource usage reported by the worker.
    pub stats: ResourceStats,

    /// Where the attempt's log output is.
    pub log: Option<LogHandle>,
}

/// Why a run was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[non_exhaustive]
pub enum CancelReason {
    /// An item failed and fail-fast is enabled.
    TestFailure,

    /// An interrupt (on Unix, Ctrl-C) was received.
    Interrupt,

    /// A second interrupt was received, so running items were terminated too.
    SecondSignal,
}

impl CancelReason {
    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            CancelReason::TestFailure => "test failure",
            CancelReason::Interrupt => "interrupt",
            CancelReason::SecondSignal => "second signal",
        }
    }
}

/// Why an item was never run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotRunReason {
    /// The run was cancelled before the item was claimed.
    Cancelled,

    /// Every worker that could have run the item failed to start.
    NoWorkers,
}

/// The final status of an item.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalStatus {
    /// The item was attempted; this is the outcome of its last attempt.
    Finished(AttemptOutcome),

    /// The item was never attempted.
    NotRun(NotRunReason),
}

impl FinalStatus {
    /// Returns true if the item passed.
    pub fn is_success(self) -> bool {
        self == Self::Finished(AttemptOutcome::Passed)
    }
}

/// An event produced during a run.
#[derive(Clone, Debug)]
pub struct RunEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of event this is.
    pub kind: RunEventKind,
}

/// The kind of run event this is.
///
/// Forms part of [`RunEvent`].
#[derive(Clone, Debug)]
pub enum RunEventKind {
    /// The run started.
    RunStarted {
        /// The run's ID.
        run_id: RunId,

        /// The profile chosen for this run.
        profile_name: String,

        /// The number of items that will be run.
        item_count: usize,

        /// The number of workers that will be started.
        worker_count: usize,
    },

    /// A worker started.
    WorkerStarted {
        /// The worker's ID.
        worker: WorkerId,

        /// The worker's process ID.
        pid: u32,
    },

    /// A worker was terminated and a new one started in its place.
    WorkerReplaced {
        /// The worker that was terminated.
        old: WorkerId,

        /// Why the old worker was terminated.
        reason: TerminateReason,

        /// The new worker.
        new: WorkerId,

        /// The new worker's process ID.
        pid: u32,
    },

    /// A worker failed to start.
    WorkerStartFailed {
        /// The ID the worker would have had.
        worker: WorkerId,

        /// The worker it would have replaced, if any.
        replacing: Option<WorkerId>,

        /// The error.
        error: Arc<WorkerStartError>,
    },

    /// An attempt at an item started.
    AttemptStarted {
        /// The item.
        instance: Arc<TestInstance>,

        /// The attempt number, starting at 1.
        attempt: u32,

        /// The total number of attempts the item may have.
        total_attempts: u32,

        /// The worker running the attempt.
        worker: WorkerId,
    },

    /// An attempt at an item finished.
    AttemptFinished {
        /// The item.
        instance: Arc<TestInstance>,

        /// The attempt.
        attempt: Attempt,

        /// The total number of attempts the item may have.
        total_attempts: u32,

        /// If the item will be retried, the delay before the next attempt.
        will_retry: Option<Duration>,
    },

    /// An item finished: it passed, or ran out of attempts.
    ItemFinished {
        /// The item.
        instance: Arc<TestInstance>,

        /// The item's final status.
        status: FinalStatus,

        /// The number of attempts made.
        attempt_count: usize,
    },

    /// The run was cancelled. No new items are claimed after this, but items already running
    /// finish normally.
    ///
    /// Sent a second time with [`CancelReason::SecondSignal`] if running items are being
    /// terminated as well.
    RunCancelled {
        /// Why the run was cancelled.
        reason: CancelReason,

        /// The item whose failure caused the cancellation, if any.
        item: Option<ItemId>,
    },

    /// The run finished.
    RunFinished {
        /// The run's ID.
        run_id: RunId,

        /// When the run started.
        start_time: DateTime<FixedOffset>,

        /// How long the run took.
        elapsed: Duration,

        /// Statistics for the run.
        stats: RunStats,
    },
}

/// Statistics for a run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of items in the run.
    pub initial_run_count: usize,

    /// The number of items that finished, i.e. were attempted at least once.
    pub finished_count: usize,

    /// The number of items that passed. Includes `flaky`.
    pub passed: usize,

    /// The number of items that passed on a retry.
    pub flaky: usize,

    /// The number of items whose last attempt failed.
    pub failed: usize,

    /// The number of items whose last attempt errored.
    pub errored: usize,

    /// The number of items whose last attempt timed out.
    pub timed_out: usize,

    /// The number of items whose last attempt crashed a worker.
    pub crashed: usize,

    /// The number of items that were never run.
    pub not_run: usize,

    /// The total number of attempts.
    pub attempts: usize,

    /// The number of workers started, including replacements.
    pub workers_started: usize,

    /// The number of workers replaced.
    pub workers_replaced: usize,
}

impl RunStats {
    /// Returns true if this run is considered a success.
    ///
    /// A run fails if any item failed in any way, or if any item was not run.
    pub fn is_success(&self) -> bool {
        !self.any_failed() && self.initial_run_count == self.finished_count
    }

    /// Returns true if any item's final outcome was not a pass.
    #[inline]
    pub fn any_failed(&self) -> bool {
        self.failed > 0 || self.errored > 0 || self.timed_out > 0 || self.crashed > 0
    }

    pub(crate) fn on_item_finished(&mut self, status: FinalStatus, attempt_count: usize) {
        match status {
            FinalStatus::Finished(outcome) => {
                self.finished_count += 1;
                match outcome {
                    AttemptOutcome::Passed => {
                        self.passed += 1;
                        if attempt_count > 1 {
                            self.flaky += 1;
                        }
                    }
                    AttemptOutcome::Failed => self.failed += 1,
                    AttemptOutcome::Errored => self.errored += 1,
                    AttemptOutcome::TimedOut => self.timed_out += 1,
                    AttemptOutcome::Crashed => self.crashed += 1,
                }
            }
            FinalStatus::NotRun(_) => self.not_run += 1,
        }
    }
}

/// The result of one item in a run.
#[derive(Clone, Debug)]
pub struct ItemResult {
    /// The item.
    pub instance: Arc<TestInstance>,

    /// Every attempt, in order.
    pub attempts: Vec<Attempt>,

    /// The item's final status.
    pub status: FinalStatus,
}

impl ItemResult {
    /// Returns true if the item passed, but only after a retry.
    pub fn is_flaky(&self) -> bool {
        self.status.is_success() && self.attempts.len() > 1
    }
}

/// The outcome of a whole run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// The run's ID.
    pub run_id: RunId,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took.
    pub elapsed: Duration,

    /// Every item's result, in discovery order.
    pub items: Vec<ItemResult>,

    /// Statistics for the run.
    pub stats: RunStats,

    /// Set if the run was cancelled.
    pub cancelled: Option<CancelReason>,
}

impl RunSummary {
    /// Looks up an item's result by ID.
    pub fn item(&self, id: &ItemId) -> Option<&ItemResult> {
        self.items.iter().find(|result| result.instance.id() == id)
    }

    /// Records every attempted item's final outcome in `cache`.
    ///
    /// Items that were not run keep whatever outcome the cache already has.
    pub fn update_status_cache(&self, cache: &mut StatusCache) {
        for result in &self.items {
            if let FinalStatus::Finished(outcome) = result.status {
                cache.record(result.instance.id().clone(), outcome);
            }
        }
    }
}
