// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::SetupHandle;
use crate::errors::SetupError;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::sync::OnceCell;

type SetupSlot = Arc<OnceCell<Result<SetupHandle, SetupError>>>;

/// Setups evaluated on one worker, by name.
///
/// Each setup is evaluated at most once per worker. The first caller to ask for a setup evaluates
/// it; concurrent callers wait for that evaluation and share its result. A failed evaluation is
/// cached too, so every later item that needs the setup fails the same way without re-running it.
///
/// If the caller evaluating a setup is cancelled, e.g. by a timeout, the slot stays empty and the
/// next caller evaluates it instead.
#[derive(Debug, Default)]
pub struct SetupCache {
    slots: Mutex<HashMap<String, SetupSlot>>,
}

impl SetupCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for the setup called `name`, calling `evaluate` if no result is cached
    /// yet.
    pub async fn resolve<F, Fut>(&self, name: &str, evaluate: F) -> Result<SetupHandle, SetupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SetupHandle, SetupError>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.entry(name.to_owned()).or_default().clone()
        };
        slot.get_or_init(evaluate).await.clone()
    }

    /// Returns the cached result for a setup, if it has been evaluated.
    pub fn get(&self, name: &str) -> Option<Result<SetupHandle, SetupError>> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(name)?.get().cloned()
    }
}
