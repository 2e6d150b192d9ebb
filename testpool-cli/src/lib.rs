// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `testpool` command-line tool.
//!
//! `testpool run --manifest items.json` reads a JSON manifest of items and setups, starts a pool
//! of worker processes and runs every item, printing one line per attempt and a summary at the
//! end. Workers are this same binary, re-invoked with a hidden `__worker` subcommand that treats
//! items and setups as command lines.
//!
//! Exit codes follow [`TestpoolExitCode`].

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod manifest;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
pub use output::{OutputContext, StderrStyles};
