// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory usage sampling.
//!
//! Before each dispatch, the scheduler asks a [`MemoryMonitor`] how much of the system's memory is
//! in use. If that exceeds the configured threshold, the worker is recycled before the item runs.

use std::fmt;

/// Reports how much system memory is in use.
pub trait MemoryMonitor: fmt::Debug + Send + Sync {
    /// Returns the fraction of total system memory currently in use, between 0.0 and 1.0, or
    /// `None` if it can't be determined.
    fn used_fraction(&self) -> Option<f64>;
}

/// Reads system memory usage from the operating system.
///
/// Only Linux is supported; elsewhere usage is unknown and workers are never recycled for memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemory;

impl MemoryMonitor for SystemMemory {
    fn used_fraction(&self) -> Option<f64> {
        read_meminfo()?.used_fraction()
    }
}

/// A monitor that always reports the same usage.
///
/// Useful for embedding testpool somewhere the system figure isn't meaningful, and in tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedMemoryUsage(pub f64);

impl MemoryMonitor for FixedMemoryUsage {
    fn used_fraction(&self) -> Option<f64> {
        Some(self.0)
    }
}

/// The fields of `/proc/meminfo` testpool cares about, in KiB.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MemInfo {
    pub(crate) total_kib: u64,
    pub(crate) available_kib: u64,
}

impl MemInfo {
    /// Parses the contents of `/proc/meminfo`.
    pub(crate) fn parse(contents: &str) -> Option<Self> {
        let mut total_kib = None;
        let mut available_kib = None;
        for line in contents.lines() {
            // Format: "MemAvailable:    12345678 kB"
            let mut parts = line.split_whitespace();
            let slot = match parts.next() {
                Some("MemTotal:") => &mut total_kib,
                Some("MemAvailable:") => &mut available_kib,
                _ => continue,
            };
            *slot = parts.next().and_then(|kib| kib.parse::<u64>().ok());
        }
        Some(Self {
            total_kib: total_kib?,
            available_kib: available_kib?,
        })
    }

    pub(crate) fn used_fraction(&self) -> Option<f64> {
        if self.total_kib == 0 {
            return None;
        }
        let used = self.total_kib.saturating_sub(self.available_kib);
        Some(used as f64 / self.total_kib as f64)
    }
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> Option<MemInfo> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    MemInfo::parse(&contents)
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> Option<MemInfo> {
    None
}

/// Reads the resident set size of a process in MiB.
///
/// `/proc/<pid>/statm` has the format `size resident shared text lib data dt`, in pages.
#[cfg(target_os = "linux")]
pub fn process_rss_mib(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    // Assume 4 KiB pages.
    Some(resident_pages * 4 / 1024)
}

/// Reads the resident set size of a process in MiB.
#[cfg(not(target_os = "linux"))]
pub fn process_rss_mib(_pid: u32) -> Option<u64> {
    None
}
