// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{config::core::get_num_cpus, errors::WorkerCountParseError};
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr};

/// Type for the `workers` config key: how many worker processes a run starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerCount {
    /// Start exactly this many workers.
    Count(usize),

    /// Start one worker per logical CPU.
    NumCpus,
}

impl WorkerCount {
    /// Gets the actual number of workers computed at runtime. Always at least 1.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count.max(1),
            Self::NumCpus => get_num_cpus(),
        }
    }

    // Negative counts are relative to the CPU count, e.g. -1 leaves one CPU free.
    fn from_signed(count: i64) -> Option<Self> {
        match count.cmp(&0) {
            Ordering::Greater => Some(Self::Count(count as usize)),
            Ordering::Less => Some(Self::Count((get_num_cpus() as i64 + count).max(1) as usize)),
            Ordering::Equal => None,
        }
    }
}

impl FromStr for WorkerCount {
    type Err = WorkerCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        let count: i64 = s
            .parse()
            .map_err(|err| WorkerCountParseError::new(format!("{s} ({err})")))?;
        Self::from_signed(count).ok_or_else(|| WorkerCountParseError::new("0 (must be non-zero)"))
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = WorkerCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a non-zero integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(WorkerCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // TOML integers arrive as i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                WorkerCount::from_signed(v).ok_or_else(|| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let v = i64::try_from(v).map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Unsigned(v), &self)
                })?;
                self.visit_i64(v)
            }
        }

        deserializer.deserialize_any(V)
    }
}
