// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage and retrieval of item outcomes from previous runs.
//!
//! The status cache drives failures-first ordering: items that did not pass last time are
//! dispatched before everything else.

use super::ItemId;
use crate::reporter::events::AttemptOutcome;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs};

/// The last known outcome of each item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusCache {
    statuses: BTreeMap<ItemId, AttemptOutcome>,
}

impl StatusCache {
    /// Returns the last recorded outcome of an item.
    pub fn get(&self, id: &ItemId) -> Option<AttemptOutcome> {
        self.statuses.get(id).copied()
    }

    /// Records the final outcome of an item, replacing any earlier outcome.
    pub fn record(&mut self, id: ItemId, outcome: AttemptOutcome) {
        self.statuses.insert(id, outcome);
    }

    /// Returns the number of items with a recorded outcome.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns true if no outcomes are recorded.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Returns the dispatch priority of an item: lower runs earlier.
    pub(crate) fn priority(&self, id: &ItemId) -> u8 {
        match self.get(id) {
            Some(outcome) if !outcome.is_success() => 0,
            None => 1,
            Some(_) => 2,
        }
    }
}

/// Status cache data, serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCacheSnapshot {
    /// Version of the snapshot format.
    pub version: u32,

    /// When this snapshot was created.
    pub created_at: DateTime<Utc>,

    /// The last outcome of each item.
    pub statuses: BTreeMap<ItemId, AttemptOutcome>,
}

/// Manages persistence of the status cache.
#[derive(Clone, Debug)]
pub struct StatusCacheStore {
    path: Utf8PathBuf,
}

impl StatusCacheStore {
    /// Current version of the snapshot format.
    const CURRENT_VERSION: u32 = 1;

    /// The file name of the snapshot within a store directory.
    pub const FILE_NAME: &'static str = "status-cache.json";

    /// Creates a new store that keeps its snapshot in `store_dir`.
    pub fn new(store_dir: &Utf8Path) -> Self {
        Self::at_path(store_dir.join(Self::FILE_NAME))
    }

    /// Creates a new store that keeps its snapshot at `path`.
    pub fn at_path(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the snapshot file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the status cache from disk. A missing file loads as an empty cache.
    pub fn load(&self) -> Result<StatusCache, StatusCacheLoadError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StatusCache::default());
            }
            Err(err) => {
                return Err(StatusCacheLoadError::ReadError {
                    path: self.path.clone(),
                    error: err,
                });
            }
        };

        let snapshot: StatusCacheSnapshot = serde_json::from_str(&contents).map_err(|err| {
            StatusCacheLoadError::DeserializeError {
                path: self.path.clone(),
                error: err,
            }
        })?;

        if snapshot.version != Self::CURRENT_VERSION {
            return Err(StatusCacheLoadError::VersionMismatch {
                path: self.path.clone(),
                expected: Self::CURRENT_VERSION,
                actual: snapshot.version,
            });
        }

        Ok(StatusCache {
            statuses: snapshot.statuses,
        })
    }

    /// Saves the status cache to disk.
    pub fn save(&self, cache: &StatusCache) -> Result<(), StatusCacheSaveError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StatusCacheSaveError::CreateDirError {
                path: parent.to_owned(),
                error: err,
            })?;
        }

        let snapshot = StatusCacheSnapshot {
            version: Self::CURRENT_VERSION,
            created_at: Utc::now(),
            statuses: cache.statuses.clone(),
        };
        let contents = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| StatusCacheSaveError::SerializeError { error: err })?;

        fs::write(&self.path, contents).map_err(|err| StatusCacheSaveError::WriteError {
            path: self.path.clone(),
            error: err,
        })
    }
}

/// Errors that can occur when loading the status cache.
#[derive(Debug, thiserror::Error)]
pub enum StatusCacheLoadError {
    /// Error reading the snapshot file.
    #[error("failed to read status cache at {path}")]
    ReadError {
        /// The path that failed to be read.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// Error deserializing the snapshot.
    #[error("failed to deserialize status cache at {path}")]
    DeserializeError {
        /// The path that failed to be deserialized.
        path: Utf8PathBuf,
        /// The underlying deserialization error.
        #[source]
        error: serde_json::Error,
    },

    /// The snapshot was written by an incompatible version.
    #[error("status cache version mismatch at {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// The path with the version mismatch.
        path: Utf8PathBuf,
        /// The expected version.
        expected: u32,
        /// The actual version found.
        actual: u32,
    },
}

/// Errors that can occur when saving the status cache.
#[derive(Debug, thiserror::Error)]
pub enum StatusCacheSaveError {
    /// Error creating the directory.
    #[error("failed to create directory {path}")]
    CreateDirError {
        /// The directory path that failed to be created.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// Error serializing the snapshot.
    #[error("failed to serialize status cache")]
    SerializeError {
        /// The underlying serialization error.
        #[source]
        error: serde_json::Error,
    },

    /// Error writing the snapshot to disk.
    #[error("failed to write status cache to {path}")]
    WriteError {
        /// The path that failed to be written.
        path: Utf8PathBuf,
        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },
}
