// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker processes: starting them, talking to them, and the serving side that runs inside them.
//!
//! The coordinator side is built around [`Worker`], a handle to a process it spawned. The process
//! side is built around [`serve`], which a worker binary calls with its own [`UnitHandler`].

mod command;
mod lifecycle;
mod memory;
mod pending;
mod protocol;
mod serve;
mod setup_cache;
mod signals;
mod transport;

pub use command::*;
pub use lifecycle::*;
pub use memory::*;
pub use pending::PendingCall;
pub use protocol::*;
pub use serve::*;
pub use setup_cache::*;
pub use signals::ProcessExit;
pub(crate) use signals::TerminateSignal;
pub use transport::WorkerCommand;

/// Environment variable carrying the concurrency hint for a worker.
pub const WORKER_THREADS_ENV: &str = "TESTPOOL_WORKER_THREADS";

/// Environment variable carrying a worker's ID.
pub const WORKER_ID_ENV: &str = "TESTPOOL_WORKER_ID";

/// Environment variable carrying the ID of the run a worker belongs to.
pub const RUN_ID_ENV: &str = "TESTPOOL_RUN_ID";
