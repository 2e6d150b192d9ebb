// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use std::error::Error;
use testpool_runner::{errors::*, helpers::plural};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Process exit codes returned by `testpool`.
pub enum TestpoolExitCode {}

impl TestpoolExitCode {
    /// Every item passed.
    pub const OK: i32 = 0;

    /// One or more items failed, or some items were not run.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// The run could not be set up, or was aborted because of an infrastructure failure.
    pub const SETUP_ERROR: i32 = 96;

    /// Any other error.
    pub const OTHER_ERROR: i32 = 1;
}

// The #[error()] strings are short summaries. The expected way to print errors is
// display_to_stderr, which adds context and the source chain.

/// An error that `testpool` knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("workspace root is invalid")]
    WorkspaceRootInvalid {
        #[source]
        err: std::io::Error,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("failed to create store directory")]
    StoreDirCreateError {
        store_dir: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to read manifest")]
    ManifestReadError {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse manifest")]
    ManifestParseError {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("invalid test list")]
    TestListError {
        path: Utf8PathBuf,
        #[source]
        err: TestListError,
    },
    #[error("failed to locate the current executable")]
    CurrentExeError {
        #[source]
        err: std::io::Error,
    },
    #[error("test runner build error")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test run aborted")]
    TestRunnerExecuteError {
        #[from]
        err: TestRunnerExecuteError,
    },
    #[error("failed to write event")]
    WriteEventError {
        #[source]
        err: std::io::Error,
    },
    #[error("worker failed")]
    WorkerServeError {
        #[from]
        err: ServeError,
    },
    #[error("test run failed")]
    TestRunFailed,
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::WorkspaceRootInvalid { .. }
            | Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::StoreDirCreateError { .. }
            | Self::ManifestReadError { .. }
            | Self::ManifestParseError { .. }
            | Self::TestListError { .. }
            | Self::CurrentExeError { .. }
            | Self::TestRunnerBuildError { .. }
            | Self::TestRunnerExecuteError { .. } => TestpoolExitCode::SETUP_ERROR,
            Self::TestRunFailed => TestpoolExitCode::TEST_RUN_FAILED,
            Self::WriteEventError { .. } | Self::WorkerServeError { .. } => {
                TestpoolExitCode::OTHER_ERROR
            }
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::WorkspaceRootInvalid { err } => {
                error!("could not determine workspace root");
                Some(err as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.inner() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                err.source()
            }
            Self::StoreDirCreateError { store_dir, err } => {
                error!(
                    "failed to create store directory `{}`",
                    store_dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::ManifestReadError { path, err } => {
                error!("failed to read manifest `{}`", path.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::ManifestParseError { path, err } => {
                error!("failed to parse manifest `{}`", path.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::TestListError { path, err } => {
                error!("manifest `{}` is invalid: {err}", path.style(styles.bold));
                err.source()
            }
            Self::CurrentExeError { err } => {
                error!("failed to locate the testpool executable to launch workers");
                Some(err as &dyn Error)
            }
            Self::TestRunnerBuildError { err } => {
                error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::TestRunnerExecuteError { err } => match err {
                TestRunnerExecuteError::NoWorkersStarted { errors } => {
                    error!(
                        "none of the {} {} could be started",
                        errors.len().style(styles.bold),
                        plural::workers_str(errors.len()),
                    );
                    for start_error in errors {
                        error!(target: NO_HEADING_TARGET, "  - {start_error}");
                    }
                    None
                }
                other => {
                    error!("{other}");
                    other.source()
                }
            },
            Self::WriteEventError { err } => {
                error!("failed to write event to output");
                Some(err as &dyn Error)
            }
            Self::WorkerServeError { err } => {
                error!("worker failed");
                Some(err as &dyn Error)
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
        };

        while let Some(err) = next_error {
            error!(
                target: NO_HEADING_TARGET,
                "\n{}\n  {}",
                "Caused by:".style(styles.warning_text),
                err,
            );
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ExpectedError::TestRunFailed, TestpoolExitCode::TEST_RUN_FAILED; "run failed")]
    #[test_case(
        ExpectedError::TestRunnerExecuteError {
            err: TestRunnerExecuteError::NoWorkersStarted { errors: Vec::new() },
        },
        TestpoolExitCode::SETUP_ERROR;
        "no workers"
    )]
    #[test_case(
        ExpectedError::CurrentExeError {
            err: std::io::Error::other("gone"),
        },
        TestpoolExitCode::SETUP_ERROR;
        "current exe"
    )]
    #[test_case(
        ExpectedError::WriteEventError {
            err: std::io::Error::other("broken pipe"),
        },
        TestpoolExitCode::OTHER_ERROR;
        "write error"
    )]
    fn exit_codes(error: ExpectedError, expected: i32) {
        assert_eq!(error.process_exit_code(), expected);
    }
}
