// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for the items and setups that make up a run.
//!
//! A [`TestList`] is built from already-discovered [`TestItem`]s and [`TestSetup`]s. It assigns
//! sequence numbers in discovery order, and produces the order items are dispatched in.

mod status_cache;
mod test_item;
mod test_list;

pub use status_cache::*;
pub use test_item::*;
pub use test_list::*;
