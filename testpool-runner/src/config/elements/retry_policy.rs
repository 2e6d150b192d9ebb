// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;
use std::{fmt, time::Duration};

/// Type for the `retries` config key.
///
/// Retries apply to every non-passing outcome: failures, errors, timeouts and crashes.
#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backoff", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RetryPolicy {
    /// The same delay before every retry.
    #[serde(rename_all = "kebab-case")]
    Fixed {
        /// Maximum retry count.
        count: u32,

        /// Delay between retries.
        #[serde(default, with = "humantime_serde")]
        delay: Duration,

        /// If true, each delay is scaled by a random factor in (0.5, 1].
        #[serde(default)]
        jitter: bool,
    },

    /// A delay that doubles before every retry.
    #[serde(rename_all = "kebab-case")]
    Exponential {
        /// Maximum retry count.
        count: u32,

        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        delay: Duration,

        /// If true, each delay is scaled by a random factor in (0.5, 1].
        #[serde(default)]
        jitter: bool,

        /// Upper bound on the delay between retries.
        #[serde(default, with = "humantime_serde")]
        max_delay: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self::new_without_delay(0)
    }
}

impl RetryPolicy {
    /// Creates a policy that retries immediately, up to `count` times.
    pub fn new_without_delay(count: u32) -> Self {
        Self::Fixed {
            count,
            delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Returns the number of retries.
    pub fn count(&self) -> u32 {
        match self {
            Self::Fixed { count, .. } | Self::Exponential { count, .. } => *count,
        }
    }

    /// Returns the same policy with a different retry count, keeping its backoff.
    ///
    /// Exponential backoff needs at least one retry, so a count of zero gives a policy that
    /// never retries.
    pub fn with_count(self, count: u32) -> Self {
        match self {
            Self::Fixed { delay, jitter, .. } => Self::Fixed {
                count,
                delay,
                jitter,
            },
            Self::Exponential { .. } if count == 0 => Self::new_without_delay(0),
            Self::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => Self::Exponential {
                count,
                delay,
                jitter,
                max_delay,
            },
        }
    }

    /// Returns the number of retries for an item that may carry its own retry count.
    ///
    /// The larger of the two wins, so an item can ask for more retries than the run grants but
    /// never fewer.
    pub fn count_for_item(&self, item_retries: Option<u32>) -> u32 {
        self.count().max(item_retries.unwrap_or(0))
    }
}

/// Deserializes `retries = 3` or `retries = { backoff = ..., count = 3, ... }`.
pub(in crate::config) fn deserialize_retry_policy<'de, D>(
    deserializer: D,
) -> Result<Option<RetryPolicy>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct RetriesVisitor;

    impl RetriesVisitor {
        fn from_count<E: serde::de::Error>(
            &self,
            count: Option<u32>,
            unexpected: serde::de::Unexpected<'_>,
        ) -> Result<Option<RetryPolicy>, E> {
            count
                .map(|count| Some(RetryPolicy::new_without_delay(count)))
                .ok_or_else(|| E::invalid_value(unexpected, self))
        }
    }

    impl<'v> serde::de::Visitor<'v> for RetriesVisitor {
        type Value = Option<RetryPolicy>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a retry count, or a table with `backoff` and `count`")
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            self.from_count(u32::try_from(v).ok(), serde::de::Unexpected::Signed(v))
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            self.from_count(u32::try_from(v).ok(), serde::de::Unexpected::Unsigned(v))
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'v>,
        {
            let policy =
                RetryPolicy::deserialize(serde::de::value::MapAccessDeserializer::new(map))?;
            validate(&policy).map_err(serde::de::Error::custom)?;
            Ok(Some(policy))
        }
    }

    deserializer.deserialize_any(RetriesVisitor)
}

fn validate(policy: &RetryPolicy) -> Result<(), &'static str> {
    match *policy {
        RetryPolicy::Fixed { delay, jitter, .. } => {
            if delay.is_zero() && jitter {
                return Err("`jitter` cannot be true if `delay` isn't specified or is zero");
            }
        }
        RetryPolicy::Exponential {
            count,
            delay,
            max_delay,
            ..
        } => {
            if count == 0 {
                return Err("`count` cannot be zero with exponential backoff");
            }
            if delay.is_zero() {
                return Err("`delay` cannot be zero with exponential backoff");
            }
            match max_delay {
                Some(max_delay) if max_delay.is_zero() => {
                    return Err("`max-delay` cannot be zero with exponential backoff");
                }
                Some(max_delay) if max_delay < delay => {
                    return Err("`max-delay` cannot be less than delay with exponential backoff");
                }
                _ => {}
            }
        }
    }
    Ok(())
}
