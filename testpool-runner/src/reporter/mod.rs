// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting for runs.
//!
//! The runner produces [`RunEvent`](events::RunEvent)s; [`Reporter`] renders them for humans.

mod displayer;
pub mod events;

pub use displayer::*;
