// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, time::Duration};

/// The unique identifier of a test item within a run.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Creates a new item ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An opaque, serializable description of work.
///
/// Payloads are produced by discovery and interpreted only by workers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    /// Creates a new payload.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Returns the empty payload.
    pub fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Returns the payload as a JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Converts the payload into a JSON value.
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A unit of work to run on a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestItem {
    /// The item's unique ID.
    pub id: ItemId,

    /// A human-readable name.
    pub name: String,

    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Names of the setups this item depends on, evaluated in order before the item runs.
    #[serde(default)]
    pub setups: Vec<String>,

    /// Overrides the run's per-item timeout.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Requests at least this many retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Overrides the run's fail-fast setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failfast: Option<bool>,

    /// The work itself, passed to the worker as-is.
    #[serde(default)]
    pub payload: Payload,
}

impl TestItem {
    /// Creates a new item with the given ID and payload. The name defaults to the ID.
    pub fn new(id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: ItemId::new(id),
            tags: BTreeSet::new(),
            setups: Vec::new(),
            timeout: None,
            retries: None,
            failfast: None,
            payload: payload.into(),
        }
    }

    /// Adds a setup dependency.
    pub fn with_setup(mut self, name: impl Into<String>) -> Self {
        self.setups.push(name.into());
        self
    }

    /// Sets the item's timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the item's retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the item's fail-fast override.
    pub fn with_failfast(mut self, failfast: bool) -> Self {
        self.failfast = Some(failfast);
        self
    }
}

/// Where a setup was declared.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// The file the setup was declared in.
    pub file: Utf8PathBuf,

    /// The line the setup was declared on.
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A named, shareable fixture evaluated at most once per worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestSetup {
    /// The setup's unique name.
    pub name: String,

    /// How to evaluate the setup, passed to the worker as-is.
    #[serde(default)]
    pub payload: Payload,

    /// Where the setup was declared, used in error messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
}

impl TestSetup {
    /// Creates a new setup.
    pub fn new(name: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            source: None,
        }
    }
}
