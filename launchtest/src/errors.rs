// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use launchtest_metadata::LaunchtestExitCode;
use launchtest_runner::errors::*;
use owo_colors::OwoColorize;
use std::error::Error;
use swrite::{SWrite, swrite};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are mostly placeholder messages: the expected way to print out errors is
// with the display_to_stderr method, which colorizes errors.

/// An error that launchtest expects to happen, and knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("test filter build error")]
    TestFilterBuildError {
        #[from]
        err: TestFilterBuildError,
    },
    #[error("test runner build error")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("isolation failed")]
    IsolationFailed { suites: Vec<String> },
    #[error("launch failed")]
    LaunchFailed { suites: Vec<String> },
    #[error("test run failed")]
    TestRunFailed,
    #[error("no tests to run")]
    NoTestsRun,
    #[error("report write error")]
    ReportWriteError {
        #[from]
        err: ReportWriteError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
    #[error("results directory is invalid")]
    ResultsDirInvalid { results_dir: Utf8PathBuf },
}

impl ExpectedError {
    pub(crate) fn write_output_error(err: std::io::Error) -> Self {
        Self::WriteOutputError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::TestFilterBuildError { .. }
            | Self::TestRunnerBuildError { .. }
            | Self::IsolationFailed { .. }
            | Self::ResultsDirInvalid { .. } => LaunchtestExitCode::SETUP_ERROR,
            Self::LaunchFailed { .. } => LaunchtestExitCode::LAUNCH_FAILED,
            Self::TestRunFailed => LaunchtestExitCode::TEST_RUN_FAILED,
            Self::NoTestsRun => LaunchtestExitCode::NO_TESTS_RUN,
            Self::ReportWriteError { .. } | Self::WriteOutputError { .. } => {
                LaunchtestExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse suite file at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::TestFilterBuildError { err } => {
                error!("{err}");
                err.source()
            }
            Self::TestRunnerBuildError { err } => {
                error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::IsolationFailed { suites } => {
                error!(
                    "could not obtain an isolation id for {}",
                    display_suites(suites, styles)
                );
                None
            }
            Self::LaunchFailed { suites } => {
                error!(
                    "workers failed to start for {}",
                    display_suites(suites, styles)
                );
                None
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
            Self::NoTestsRun => {
                error!("no tests to run");
                error!(
                    target: NO_HEADING_TARGET,
                    "(hint: {} to pass anyway)",
                    "--no-tests=pass".style(styles.bold),
                );
                None
            }
            Self::ReportWriteError { err } => {
                error!("failed to write report");
                Some(err as &dyn Error)
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
            Self::ResultsDirInvalid { results_dir } => {
                error!(
                    "results directory `{}` is not a directory",
                    results_dir.style(styles.bold)
                );
                None
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

fn display_suites(suites: &[String], styles: &StderrStyles) -> String {
    let mut out = String::new();
    for (i, suite) in suites.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        swrite!(out, "`{}`", suite.style(styles.bold));
    }
    out
}
