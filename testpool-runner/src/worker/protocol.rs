// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire protocol between the coordinator and its workers.
//!
//! Once a worker has printed its handshake line (`listening:<port>`) on stdout, the coordinator
//! connects to that port on the loopback interface. From then on, each side writes one JSON object
//! per line. The coordinator sends [`Request`]s, and the worker answers each with exactly one
//! [`Response`] carrying the same request ID. Responses may arrive in any order.

use crate::list::{ItemId, Payload};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The prefix of the line a worker prints on stdout once it is ready to accept a connection.
pub const HANDSHAKE_PREFIX: &str = "listening:";

/// Returns the handshake line for a worker listening on `port`.
pub fn handshake_line(port: u16) -> String {
    format!("{HANDSHAKE_PREFIX}{port}")
}

/// Parses a handshake line, returning the announced port.
pub fn parse_handshake(line: &str) -> Option<u16> {
    line.trim().strip_prefix(HANDSHAKE_PREFIX)?.parse().ok()
}

/// Identifies a request on a single worker connection.
///
/// IDs are issued by the coordinator in increasing order, starting at 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker-local reference to an evaluated setup.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetupHandle(pub u64);

/// A setup an item depends on, and its handle on the worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SetupRef {
    /// The setup's name.
    pub name: String,
    /// The handle returned when the setup was evaluated.
    pub handle: SetupHandle,
}

/// What a request asks the worker to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CallContext {
    /// Run the startup hook. Sent once, right after connecting.
    StartupHook,

    /// Evaluate a setup and keep its value for later items.
    #[serde(rename_all = "kebab-case")]
    EvaluateSetup {
        /// The setup's name.
        name: String,
        /// False if no setup with this name was declared. The worker must fail the call.
        declared: bool,
    },

    /// Run a test item.
    #[serde(rename_all = "kebab-case")]
    Execute {
        /// The item's ID.
        item_id: ItemId,
        /// The item's name.
        name: String,
        /// The attempt number, starting at 1.
        attempt: u32,
        /// The item's setups, in the order the item declares them.
        setups: Vec<SetupRef>,
    },

    /// Report what the worker is currently doing.
    Diagnostics,
}

impl CallContext {
    /// Returns a short description of the context, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartupHook => "startup-hook",
            Self::EvaluateSetup { .. } => "evaluate-setup",
            Self::Execute { .. } => "execute",
            Self::Diagnostics => "diagnostics",
        }
    }
}

/// A message from the coordinator to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Request {
    /// The request's ID.
    pub request_id: RequestId,

    /// What the request asks for. `None` only for shutdown requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<CallContext>,

    /// Opaque data for the worker.
    #[serde(default)]
    pub payload: Payload,

    /// If true, the worker should answer, then stop serving and exit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_shutdown: bool,
}

impl Request {
    /// Creates a call request.
    pub fn call(request_id: RequestId, context: CallContext, payload: Payload) -> Self {
        Self {
            request_id,
            context: Some(context),
            payload,
            is_shutdown: false,
        }
    }

    /// Creates a shutdown request.
    pub fn shutdown(request_id: RequestId) -> Self {
        Self {
            request_id,
            context: None,
            payload: Payload::null(),
            is_shutdown: true,
        }
    }

    /// Serializes to a JSON line, including the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    /// Deserializes from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// The status an item finished with, as reported by the worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    /// The item passed.
    Passed,
    /// The item ran and failed.
    Failed,
    /// The item could not be run properly.
    Errored,
}

/// Resource usage reported by a worker alongside an execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceStats {
    /// Resident set size of the worker after the item ran, in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_mib: Option<u64>,

    /// How long the item ran for, as measured by the worker.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub elapsed: Option<Duration>,
}

/// Where the log output of an execution can be found.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum LogHandle {
    /// The log output itself.
    Inline(String),
    /// A file containing the log output.
    File(Utf8PathBuf),
}

/// The outcome of an execute call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionReport {
    /// How the item finished.
    pub status: ItemStatus,

    /// A short human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resource usage.
    #[serde(default)]
    pub stats: ResourceStats,

    /// The item's log output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogHandle>,
}

impl ExecutionReport {
    /// Creates a report with the given status and no other information.
    pub fn new(status: ItemStatus) -> Self {
        Self {
            status,
            message: None,
            stats: ResourceStats::default(),
            log: None,
        }
    }

    /// Sets the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A successful result of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CallResult {
    /// The call succeeded and has no other result.
    Ack,

    /// A setup was evaluated.
    SetupEvaluated {
        /// The handle to pass to later execute calls.
        handle: SetupHandle,
    },

    /// An item was executed.
    Executed(ExecutionReport),

    /// The worker's diagnostics.
    Diagnostics {
        /// A human-readable report.
        report: String,
    },
}

impl CallResult {
    /// Returns a short description of the result, used in errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::SetupEvaluated { .. } => "setup-evaluated",
            Self::Executed(_) => "executed",
            Self::Diagnostics { .. } => "diagnostics",
        }
    }
}

/// An error reported by a worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// The error message.
    pub message: String,
}

/// A message from a worker to the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Response {
    /// The ID of the request this answers.
    pub request_id: RequestId,

    /// The result, if the call succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CallResult>,

    /// The error, if the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    /// Creates a successful response.
    pub fn ok(request_id: RequestId, result: CallResult) -> Self {
        Self {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            result: None,
            error: Some(RemoteError {
                message: message.into(),
            }),
        }
    }

    /// Serializes to a JSON line, including the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    /// Deserializes from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

fn to_line(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    Ok(json)
}
