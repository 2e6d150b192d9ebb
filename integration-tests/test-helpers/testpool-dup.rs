// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A copy of the `testpool` binary.
//!
//! Binaries from another package aren't visible to this package's tests through
//! `CARGO_BIN_EXE_*`, so the tests run this one instead.

use clap::Parser;
use color_eyre::Result;
use testpool_cli::TestpoolApp;

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = enable_ansi_support::enable_ansi_support();

    let app = TestpoolApp::parse();
    let output = app.init_output();

    match app.exec(output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
