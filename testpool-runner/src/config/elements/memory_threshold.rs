// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::MemoryThresholdParseError;
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Type for the `memory-threshold` config key.
///
/// Before each item is dispatched, the fraction of total system memory in use is compared against
/// this threshold. If usage is strictly greater, the worker is replaced with a fresh process first.
/// A threshold of 1.0 therefore never triggers a replacement, and 0.0 replaces the worker before
/// every item.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct MemoryThreshold(f64);

impl MemoryThreshold {
    /// A threshold that never triggers a replacement.
    pub const DISABLED: Self = Self(1.0);

    /// Creates a new threshold, returning `None` if `fraction` is outside `[0.0, 1.0]`.
    pub fn new(fraction: f64) -> Option<Self> {
        (0.0..=1.0).contains(&fraction).then_some(Self(fraction))
    }

    /// Returns the threshold as a fraction.
    pub fn fraction(self) -> f64 {
        self.0
    }

    /// Returns true if `used_fraction` of system memory is over this threshold.
    pub fn is_exceeded_by(self, used_fraction: f64) -> bool {
        used_fraction > self.0
    }
}

impl Default for MemoryThreshold {
    fn default() -> Self {
        Self(0.99)
    }
}

impl FromStr for MemoryThreshold {
    type Err = MemoryThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<f64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| MemoryThresholdParseError::new(s))
    }
}

impl fmt::Display for MemoryThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for MemoryThreshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MemoryThreshold;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a number between 0.0 and 1.0")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                MemoryThreshold::new(v).ok_or_else(|| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Float(v), &self)
                })
            }

            // Allows `memory-threshold = 0` and `memory-threshold = 1`.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v {
                    0 | 1 => Ok(MemoryThreshold(v as f64)),
                    _ => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v {
                    0 | 1 => Ok(MemoryThreshold(v as f64)),
                    _ => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
