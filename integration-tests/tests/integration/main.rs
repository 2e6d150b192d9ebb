// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for testpool.
//!
//! These tests start real worker processes. Most of them use the `fixture-worker` binary, whose
//! items are scripted through their payloads (see `test-helpers/fixture-worker.rs`). The `cli`
//! tests run `testpool-dup`, a copy of the `testpool` binary, against a manifest of shell commands.

mod basic;
mod cli;
mod crash;
mod fail_fast;
mod fixtures;
mod memory;
mod setups;
mod startup;
mod timeout;
mod worker;
