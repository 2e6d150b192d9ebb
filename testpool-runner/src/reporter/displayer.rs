// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable output for run events.

use super::events::{
    Attempt, AttemptOutcome, CancelReason, FinalStatus, NotRunReason, RunEvent, RunEventKind,
    RunStats,
};
use crate::{
    helpers::{DisplayDuration, plural},
    list::TestInstance,
    worker::LogHandle,
};
use debug_ignore::DebugIgnore;
use owo_colors::{OwoColorize, Style};
use std::{
    fmt::Write as _,
    io::{self, Write},
    sync::Arc,
};

/// Builder for [`Reporter`].
#[derive(Clone, Debug, Default)]
pub struct ReporterBuilder {
    verbose: bool,
}

impl ReporterBuilder {
    /// If set, every attempt and worker event is shown, not just results.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Creates a new reporter.
    pub fn build(&self) -> Reporter {
        Reporter {
            verbose: self.verbose,
            styles: Box::default(),
            cancel_status: None,
            failures: DebugIgnore(Vec::new()),
        }
    }
}

/// Writes run events to a terminal or other writer.
#[derive(Debug)]
pub struct Reporter {
    verbose: bool,
    styles: Box<Styles>,
    cancel_status: Option<CancelReason>,
    failures: DebugIgnore<Vec<(Arc<TestInstance>, FinalStatus)>>,
}

impl Reporter {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Writes an event.
    pub fn report_event(&mut self, event: &RunEvent, writer: &mut dyn Write) -> io::Result<()> {
        match &event.kind {
            RunEventKind::RunStarted {
                run_id,
                profile_name,
                item_count,
                worker_count,
            } => {
                writeln!(writer, "------------")?;
                writeln!(
                    writer,
                    "{:>12} ID {} with profile: {}",
                    "Testpool run".style(self.styles.pass),
                    run_id.style(self.styles.count),
                    profile_name.style(self.styles.count),
                )?;
                writeln!(
                    writer,
                    "{:>12} {} {} across {} {}",
                    "Starting".style(self.styles.pass),
                    item_count.style(self.styles.count),
                    plural::items_str(*item_count),
                    worker_count.style(self.styles.count),
                    plural::workers_str(*worker_count),
                )?;
            }
            RunEventKind::WorkerStarted { worker, pid } => {
                if self.verbose {
                    writeln!(
                        writer,
                        "{:>12} {worker} (pid {pid})",
                        "WORKER".style(self.styles.pass),
                    )?;
                }
            }
            RunEventKind::WorkerReplaced {
                old,
                reason,
                new,
                pid,
            } => {
                writeln!(
                    writer,
                    "{:>12} {old} ({reason}) with {new} (pid {pid})",
                    "REPLACE".style(self.styles.retry),
                )?;
            }
            RunEventKind::WorkerStartFailed {
                worker,
                replacing,
                error,
            } => {
                write!(
                    writer,
                    "{:>12} {worker}",
                    "START FAIL".style(self.styles.fail)
                )?;
                if let Some(old) = replacing {
                    write!(writer, " (replacing {old})")?;
                }
                writeln!(writer, ": {error}")?;
            }
            RunEventKind::AttemptStarted {
                instance,
                attempt,
                total_attempts,
                worker,
            } => {
                if self.verbose {
                    let status = if *attempt == 1 {
                        "START".to_owned()
                    } else {
                        format!("TRY {attempt}/{total_attempts}")
                    };
                    writeln!(
                        writer,
                        "{:>12} {:>16} {} ({worker})",
                        status.style(self.styles.retry),
                        "",
                        instance.item.name.style(self.styles.item),
                    )?;
                }
            }
            RunEventKind::AttemptFinished {
                instance,
                attempt,
                total_attempts,
                will_retry,
            } => {
                self.write_status_line(instance, attempt, *total_attempts, writer)?;
                if !attempt.outcome.is_success() {
                    self.write_attempt_details(attempt, writer)?;
                    if let Some(delay) = will_retry {
                        writeln!(
                            writer,
                            "{:>12} {} in {}",
                            "RETRY".style(self.styles.retry),
                            instance.item.name.style(self.styles.item),
                            humantime::format_duration(*delay),
                        )?;
                    }
                }
            }
            RunEventKind::ItemFinished {
                instance, status, ..
            } => {
                if !status.is_success() {
                    self.failures.push((instance.clone(), *status));
                }
            }
            RunEventKind::RunCancelled { reason, item } => {
                self.cancel_status = self.cancel_status.max(Some(*reason));
                let (verb, consequence) = match reason {
                    CancelReason::SecondSignal => ("Killing", "running items will be terminated"),
                    _ => ("Cancelling", "running items will finish"),
                };
                write!(
                    writer,
                    "{:>12} due to {}",
                    verb.style(self.styles.fail),
                    reason.to_static_str().style(self.styles.fail),
                )?;
                if let Some(item) = item {
                    write!(writer, " in {}", item.style(self.styles.item))?;
                }
                writeln!(writer, ": {consequence}")?;
            }
            RunEventKind::RunFinished { elapsed, stats, .. } => {
                let summary_style = if stats.is_success() {
                    self.styles.pass
                } else {
                    self.styles.fail
                };
                writeln!(writer, "------------")?;
                write!(
                    writer,
                    "{:>12} {} ",
                    "Summary".style(summary_style),
                    DisplayDuration(*elapsed),
                )?;
                write!(writer, "{}", stats.finished_count.style(self.styles.count))?;
                if stats.finished_count != stats.initial_run_count {
                    write!(
                        writer,
                        "/{}",
                        stats.initial_run_count.style(self.styles.count)
                    )?;
                }
                let mut summary = String::new();
                write_summary_str(stats, &self.styles, &mut summary);
                writeln!(
                    writer,
                    " {} run: {summary}",
                    plural::items_str(stats.initial_run_count)
                )?;

                // After Ctrl-C the user has seen enough; skip the list.
                if self.cancel_status >= Some(CancelReason::Interrupt) {
                    return Ok(());
                }
                for (instance, status) in self.failures.iter() {
                    let (label, style) = match status {
                        FinalStatus::Finished(outcome) => {
                            (short_status_str(*outcome), self.styles.fail)
                        }
                        FinalStatus::NotRun(NotRunReason::Cancelled) => {
                            ("CANCEL", self.styles.skip)
                        }
                        FinalStatus::NotRun(NotRunReason::NoWorkers) => {
                            ("NO WORKER", self.styles.skip)
                        }
                    };
                    writeln!(
                        writer,
                        "{:>12} {}",
                        label.style(style),
                        instance.item.name.style(self.styles.item),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn write_status_line(
        &self,
        instance: &TestInstance,
        attempt: &Attempt,
        total_attempts: u32,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        match (attempt.outcome, attempt.number) {
            (AttemptOutcome::Passed, 1) => {
                write!(writer, "{:>12} ", "PASS".style(self.styles.pass))?;
            }
            (AttemptOutcome::Passed, n) => {
                // Use the skip color to also represent a flaky item.
                write!(
                    writer,
                    "{:>12} ",
                    format!("FLAKY {n}/{total_attempts}").style(self.styles.skip)
                )?;
            }
            (outcome, 1) => {
                write!(
                    writer,
                    "{:>12} ",
                    status_str(outcome).style(self.styles.fail)
                )?;
            }
            (outcome, n) => {
                write!(
                    writer,
                    "{:>12} ",
                    format!("TRY {n} {}", short_status_str(outcome)).style(self.styles.fail)
                )?;
            }
        }
        writeln!(
            writer,
            "{} {:>4} {}",
            DisplayDuration(attempt.duration),
            attempt.worker.to_string().style(self.styles.count),
            instance.item.name.style(self.styles.item),
        )
    }

    fn write_attempt_details(&self, attempt: &Attempt, writer: &mut dyn Write) -> io::Result<()> {
        if let Some(message) = &attempt.message {
            for line in message.lines() {
                writeln!(writer, "{:>12} {}", "", line.style(self.styles.fail_output))?;
            }
        }
        match &attempt.log {
            Some(LogHandle::Inline(log)) if !log.trim().is_empty() => {
                writeln!(
                    writer,
                    "{:>12} {}",
                    "",
                    "--- log ---".style(self.styles.fail)
                )?;
                for line in log.lines() {
                    writeln!(writer, "{:>12} {line}", "")?;
                }
            }
            Some(LogHandle::File(path)) => {
                writeln!(writer, "{:>12} log: {path}", "")?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn status_str(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Passed => "PASS",
        AttemptOutcome::Failed => "FAIL",
        AttemptOutcome::Errored => "ERROR",
        AttemptOutcome::TimedOut => "TIMEOUT",
        AttemptOutcome::Crashed => "CRASH",
    }
}

fn short_status_str(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Passed => "PASS",
        AttemptOutcome::Failed => "FAIL",
        AttemptOutcome::Errored => "ERR",
        AttemptOutcome::TimedOut => "TMT",
        AttemptOutcome::Crashed => "CRSH",
    }
}

fn write_summary_str(stats: &RunStats, styles: &Styles, out: &mut String) {
    _ = write!(
        out,
        "{} {}",
        stats.passed.style(styles.count),
        "passed".style(styles.pass)
    );
    if stats.flaky > 0 {
        _ = write!(
            out,
            " ({} {})",
            stats.flaky.style(styles.count),
            "flaky".style(styles.skip)
        );
    }

    for (count, label) in [
        (stats.failed, "failed"),
        (stats.errored, "errored"),
        (stats.timed_out, "timed out"),
        (stats.crashed, "crashed"),
    ] {
        if count > 0 {
            _ = write!(
                out,
                ", {} {}",
                count.style(styles.count),
                label.style(styles.fail)
            );
        }
    }
    if stats.not_run > 0 {
        _ = write!(
            out,
            ", {} {}",
            stats.not_run.style(styles.count),
            "not run".style(styles.skip)
        );
    }
    if stats.workers_replaced > 0 {
        _ = write!(
            out,
            "; {} {} replaced",
            stats.workers_replaced.style(styles.count),
            plural::workers_str(stats.workers_replaced),
        );
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    retry: Style,
    fail: Style,
    fail_output: Style,
    skip: Style,
    item: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.retry = Style::new().magenta().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.skip = Style::new().yellow().bold();
        self.item = Style::new().blue().bold();
    }
}
