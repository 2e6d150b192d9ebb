// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testpool.

use crate::{
    list::ItemId,
    worker::{ProcessExit, RequestId, TerminateReason},
};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse testpool config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the underlying error.
    pub fn inner(&self) -> &ConfigError {
        &self.err
    }
}

/// An error which indicates that a profile was requested but is not defined.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a worker count from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for worker count: {input}\n\
     (hint: use a positive integer or \"num-cpus\")"
)]
pub struct WorkerCountParseError {
    input: String,
}

impl WorkerCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while parsing a memory threshold.
#[derive(Clone, Debug, Error)]
#[error("invalid memory threshold `{input}`: must be a fraction between 0.0 and 1.0")]
pub struct MemoryThresholdParseError {
    input: String,
}

impl MemoryThresholdParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while building a [`TestList`](crate::list::TestList).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TestListError {
    /// Two items share an ID.
    #[error("duplicate item ID `{id}`")]
    DuplicateItemId {
        /// The duplicated ID.
        id: ItemId,
    },

    /// Two setups share a name.
    #[error("duplicate setup name `{name}`")]
    DuplicateSetupName {
        /// The duplicated name.
        name: String,
    },
}

/// A violation of the coordinator-worker protocol.
///
/// Protocol violations are fatal: they mean the bookkeeping on one side of the connection can no
/// longer be trusted, so the run is aborted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A response arrived for a request ID that was never issued.
    #[error("received response for unknown request ID {request_id}")]
    UnknownRequestId {
        /// The request ID in the response.
        request_id: RequestId,
    },

    /// A second response arrived for a request that was already answered.
    #[error("received duplicate response for request ID {request_id}")]
    DuplicateResponse {
        /// The request ID in the response.
        request_id: RequestId,
    },

    /// A request ID was registered twice.
    #[error("request ID {request_id} is already pending")]
    DuplicateRequestId {
        /// The request ID.
        request_id: RequestId,
    },

    /// A line on the connection could not be decoded.
    #[error("failed to decode message `{line}`: {message}")]
    Decode {
        /// The offending line.
        line: String,
        /// The decoder's message.
        message: String,
    },

    /// A request could not be encoded.
    #[error("failed to encode request: {message}")]
    Encode {
        /// The encoder's message.
        message: String,
    },

    /// A response carried neither a result nor an error.
    #[error("response for request ID {request_id} carries neither a result nor an error")]
    EmptyResponse {
        /// The request ID in the response.
        request_id: RequestId,
    },

    /// A response carried a result of the wrong kind for its request.
    #[error("unexpected result for request ID {request_id}: expected {expected}, got {actual}")]
    UnexpectedResult {
        /// The request ID in the response.
        request_id: RequestId,
        /// The kind of result that was expected.
        expected: &'static str,
        /// The kind of result that was received.
        actual: &'static str,
    },
}

/// An error returned by a call to a worker.
#[derive(Clone, Debug, Error)]
pub enum CallError {
    /// The worker terminated before the call completed.
    #[error("worker terminated: {reason}")]
    WorkerTerminated {
        /// Why the worker terminated.
        reason: TerminateReason,
    },

    /// The worker reported an error while evaluating the call.
    #[error("worker reported an error: {message}")]
    Remote {
        /// The error message.
        message: String,
    },

    /// The connection to the worker broke the protocol.
    #[error("protocol violation")]
    Protocol(#[source] ProtocolError),
}

/// An error that occurred while resolving a setup on a worker.
///
/// Setup results are cached per worker, so this type is cheaply cloneable.
#[derive(Clone, Debug, Error)]
pub enum SetupError {
    /// The worker evaluated the setup and it failed.
    #[error("setup `{name}`{} failed: {message}", DisplayLocation(.source_location.as_deref()))]
    Evaluation {
        /// The setup name.
        name: String,
        /// Where the setup was declared, if known.
        source_location: Option<String>,
        /// The failure message.
        message: String,
    },

    /// The call that evaluates the setup did not complete.
    #[error("setup `{name}` could not be evaluated")]
    Interrupted {
        /// The setup name.
        name: String,
        /// The underlying call error.
        #[source]
        error: CallError,
    },
}

struct DisplayLocation<'a>(Option<&'a str>);

impl fmt::Display for DisplayLocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(location) => write!(f, " (declared at {location})"),
            None => Ok(()),
        }
    }
}

/// An error that occurred while starting a worker process.
#[derive(Debug, Error)]
pub enum WorkerStartError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker `{program}`")]
    Spawn {
        /// The program that was spawned.
        program: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The worker did not announce a port within the connect timeout.
    #[error("worker did not become ready within {timeout:?}")]
    ConnectTimeout {
        /// The connect timeout.
        timeout: Duration,
    },

    /// The worker process exited before it became ready.
    #[error("worker exited during startup ({exit})")]
    ExitedDuringStartup {
        /// How the worker exited.
        exit: ProcessExit,
        /// The last lines the worker printed.
        output: Vec<String>,
    },

    /// Reading the worker's handshake failed.
    #[error("failed to read worker handshake")]
    Handshake(#[source] std::io::Error),

    /// Connecting to the port the worker announced failed.
    #[error("failed to connect to worker on port {port}")]
    Connect {
        /// The port the worker announced.
        port: u16,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The startup hook failed.
    #[error("worker startup hook failed")]
    StartupHook(#[source] CallError),
}

impl WorkerStartError {
    /// Returns true if this error is transient and starting another worker may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExitedDuringStartup { .. })
    }
}

/// An error that occurred while building a test runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),
}

/// An error that aborted a test run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerExecuteError {
    /// No worker could be started, so nothing could run.
    #[error("none of the {} requested workers could be started", .errors.len())]
    NoWorkersStarted {
        /// The start error for each worker.
        errors: Vec<Arc<WorkerStartError>>,
    },

    /// A worker connection violated the protocol.
    #[error("run aborted due to protocol violation")]
    Protocol(#[source] ProtocolError),

    /// A dispatch loop panicked.
    #[error("dispatch loop panicked: {message}")]
    DispatchPanicked {
        /// The panic message.
        message: String,
    },
}

/// An error that occurred while serving requests in a worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServeError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// Binding the loopback listener failed.
    #[error("failed to bind loopback listener")]
    Bind(#[source] std::io::Error),

    /// Writing the handshake to stdout failed.
    #[error("failed to write handshake to stdout")]
    Handshake(#[source] std::io::Error),

    /// Accepting the coordinator's connection failed.
    #[error("failed to accept coordinator connection")]
    Accept(#[source] std::io::Error),

    /// Reading from the coordinator connection failed.
    #[error("failed to read from coordinator connection")]
    Read(#[source] std::io::Error),

    /// Writing to the coordinator connection failed.
    #[error("failed to write to coordinator connection")]
    Write(#[source] std::io::Error),

    /// A request could not be decoded.
    #[error("failed to decode request")]
    Decode(#[source] serde_json::Error),
}
