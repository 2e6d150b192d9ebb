// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::RetryPolicy;
use rand::{Rng, distr::OpenClosed01};
use std::time::Duration;

/// Produces the delay before each retry of an item.
///
/// The number of delays is the item's retry count, which may exceed the policy's own count if
/// the item asks for more retries. The policy still decides how long each delay is.
#[derive(Debug)]
pub(super) struct BackoffIter {
    policy: RetryPolicy,
    current_factor: f64,
    remaining_attempts: u32,
}

impl BackoffIter {
    const BACKOFF_EXPONENT: f64 = 2.;

    pub(super) fn new(policy: RetryPolicy, retries: u32) -> Self {
        Self {
            policy,
            current_factor: 1.,
            remaining_attempts: retries,
        }
    }

    fn next_delay_and_jitter(&mut self) -> (Duration, bool) {
        match self.policy {
            RetryPolicy::Fixed { delay, jitter, .. } => (delay, jitter),
            RetryPolicy::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => {
                let exp_delay = delay.mul_f64(self.current_factor);

                // Stop growing once the cap is reached.
                if let Some(max_delay) = max_delay
                    && exp_delay > max_delay
                {
                    return (max_delay, jitter);
                }

                self.current_factor *= Self::BACKOFF_EXPONENT;
                (exp_delay, jitter)
            }
        }
    }

    fn apply_jitter(duration: Duration) -> Duration {
        let jitter: f64 = rand::rng().sample(OpenClosed01);
        // Apply jitter in the range (0.5, 1].
        duration.mul_f64(0.5 + jitter / 2.)
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_attempts == 0 {
            return None;
        }
        let (mut delay, jitter) = self.next_delay_and_jitter();
        if jitter {
            delay = Self::apply_jitter(delay);
        }
        self.remaining_attempts -= 1;
        Some(delay)
    }
}
