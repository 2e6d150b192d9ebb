// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JSON manifest `testpool run` reads its items and setups from.

use crate::errors::{ExpectedError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use testpool_runner::list::{TestItem, TestList, TestSetup};
use tracing::warn;

/// Items and setups produced by a discovery step, in discovery order.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct TestManifest {
    #[serde(skip)]
    path: Utf8PathBuf,
    #[serde(default)]
    items: Vec<TestItem>,
    #[serde(default)]
    setups: Vec<TestSetup>,
}

impl TestManifest {
    pub(crate) fn from_path(path: &Utf8Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|err| ExpectedError::ManifestReadError {
                path: path.to_owned(),
                err,
            })?;
        Self::from_json(path, &contents)
    }

    pub(crate) fn from_json(path: &Utf8Path, contents: &str) -> Result<Self> {
        let mut manifest: Self =
            serde_json::from_str(contents).map_err(|err| ExpectedError::ManifestParseError {
                path: path.to_owned(),
                err,
            })?;
        manifest.path = path.to_owned();
        Ok(manifest)
    }

    /// Validates the manifest and turns it into a test list.
    ///
    /// References to undeclared setups are reported as warnings: the affected items still run and
    /// fail with a setup error.
    pub(crate) fn into_test_list(self) -> Result<TestList> {
        let Self {
            path,
            items,
            setups,
        } = self;
        let test_list =
            TestList::new(items, setups).map_err(|err| ExpectedError::TestListError {
                path: path.clone(),
                err,
            })?;

        for (id, setup) in test_list.undeclared_setups() {
            warn!("in `{path}`, item `{id}` depends on undeclared setup `{setup}`");
        }

        Ok(test_list)
    }
}
