// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sending termination signals to workers, and analyzing how they exited.

use serde::{Deserialize, Serialize};
use std::{fmt, process::ExitStatus};

/// How a worker process exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProcessExit {
    /// The process exited with a status code.
    Exited {
        /// The exit code.
        code: i32,
    },

    /// The process was killed by a signal.
    Signaled {
        /// The signal number.
        signal: i32,
        /// True if testpool sent this signal while terminating the worker.
        sent_by_us: bool,
    },

    /// The exit status couldn't be determined.
    Unknown,
}

impl ProcessExit {
    /// Analyzes an exit status.
    ///
    /// `sent_kill` indicates whether testpool has signalled the worker, so that a worker killed by
    /// its own coordinator isn't mistaken for one killed by the kernel.
    pub fn from_status(status: ExitStatus, sent_kill: bool) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled {
                    signal,
                    sent_by_us: sent_kill,
                };
            }
        }
        #[cfg(not(unix))]
        let _ = sent_kill;
        Self::Unknown
    }

    /// Returns true if the process exited cleanly.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Returns a likely explanation for an unexpected signal, if there is one.
    pub fn likely_cause(&self) -> Option<&'static str> {
        let Self::Signaled {
            signal,
            sent_by_us: false,
        } = *self
        else {
            return None;
        };
        match signal_name(signal)? {
            // Nobody else sends SIGKILL to workers as a rule, so the OOM killer is the usual
            // suspect.
            "SIGKILL" => Some("possibly out of memory"),
            "SIGSEGV" => Some("segmentation fault, possibly a stack overflow"),
            "SIGBUS" => Some("bus error, possibly a stack overflow"),
            "SIGABRT" => Some("aborted"),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal, .. } => {
                write!(f, "killed by signal {signal}")?;
                match (signal_name(signal), self.likely_cause()) {
                    (Some(name), Some(cause)) => write!(f, " ({name}, {cause})"),
                    (Some(name), None) => write!(f, " ({name})"),
                    (None, _) => Ok(()),
                }
            }
            Self::Unknown => write!(f, "exited for an unknown reason"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> Option<&'static str> {
    nix::sys::signal::Signal::try_from(signal)
        .ok()
        .map(|signal| signal.as_str())
}

#[cfg(not(unix))]
fn signal_name(_signal: i32) -> Option<&'static str> {
    None
}

/// The signals sent to a worker's process group while terminating it, in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TerminateSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl TerminateSignal {
    pub(crate) const ESCALATION: [Self; 3] = [Self::Interrupt, Self::Terminate, Self::Kill];

    /// Sends this signal to the process group led by `pid`.
    ///
    /// Returns false if the process group no longer exists.
    #[cfg(unix)]
    pub(crate) fn send(self, pid: u32) -> bool {
        use nix::{
            errno::Errno,
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };

        let signal = match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        };
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(err) => {
                tracing::warn!(pid, ?signal, %err, "failed to signal worker process group");
                false
            }
        }
    }

    /// Without POSIX signals, only the final kill can be delivered, and it goes through the
    /// process handle instead.
    #[cfg(not(unix))]
    pub(crate) fn send(self, _pid: u32) -> bool {
        false
    }
}

impl fmt::Display for TerminateSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}
