// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testpool-runner.

use std::{any::Any, fmt, time::Duration};

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "item" if `count` is 1, otherwise "items".
    pub fn items_str(count: usize) -> &'static str {
        if count == 1 { "item" } else { "items" }
    }

    /// Returns "worker" if `count` is 1, otherwise "workers".
    pub fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }

    /// Returns "attempt" if `count` is 1, otherwise "attempts".
    pub fn attempts_str(count: usize) -> &'static str {
        if count == 1 { "attempt" } else { "attempts" }
    }
}

/// Displays a duration as fractional seconds, right-aligned in a fixed-width column.
pub(crate) struct DisplayDuration(pub(crate) Duration);

impl fmt::Display for DisplayDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>8.3}s]", self.0.as_secs_f64())
    }
}

/// Converts an item ID into something that's safe to use as a file name component.
pub(crate) fn sanitize_file_component(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_owned()
    } else {
        sanitized
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "(non-string panic payload)"
    }
}

/// Returns the last `max_bytes` bytes of `text`, starting at a char boundary.
pub(crate) fn tail_str(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
