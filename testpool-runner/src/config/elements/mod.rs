// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for testpool.

mod memory_threshold;
mod retry_policy;
mod worker_count;

pub use memory_threshold::*;
pub use retry_policy::*;
pub use worker_count::*;
