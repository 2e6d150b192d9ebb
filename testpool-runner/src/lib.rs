// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testpool: a coordinator that runs independent test items across a pool
//! of disposable worker processes.
//!
//! The basic flow is:
//!
//! 1. A [`TestList`](list::TestList) is assembled from test items and setups produced by an
//!    external discovery layer, then ordered (optionally failures-first, using a
//!    [`StatusCache`](list::StatusCache) from a previous run).
//! 2. A [`TestRunner`](runner::TestRunner) starts `N` workers through the
//!    [`worker`] lifecycle manager. Each worker is a separate OS process speaking a small
//!    request/response protocol over a local socket.
//! 3. One dispatch loop per worker claims items from a shared cursor, resolves the item's setups on
//!    that worker (memoized per process), sends the item and races it against a timeout. Crashes,
//!    hangs and memory pressure cause the worker to be replaced; retries and fail-fast are decided
//!    locally by the loop.
//! 4. Attempts stream back as [`RunEvent`](reporter::events::RunEvent)s and are aggregated into a
//!    [`RunSummary`](reporter::events::RunSummary).

pub mod config;
pub mod errors;
pub mod helpers;
pub mod list;
pub mod reporter;
pub mod runner;
mod time;
pub mod worker;
