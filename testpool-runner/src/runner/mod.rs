// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler: runs a test list across a pool of workers.
//!
//! The main structure in this module is [`TestRunner`].

mod backoff;
mod dispatch;
mod imp;

pub use imp::*;
