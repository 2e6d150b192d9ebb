// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testpool.
//!
//! Configuration is read from `.config/testpool.toml` in the workspace root (or an explicit
//! file), layered on top of an embedded default config. Settings are grouped into named profiles,
//! and every profile inherits unset keys from `[profile.default]`.

mod core;
mod elements;

pub use self::core::*;
pub use elements::*;
