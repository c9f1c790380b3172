// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Options for each command.

use camino::Utf8PathBuf;
use clap::{Args, ValueEnum};
use launchtest_runner::{config::SuiteConfig, results::ResultsDir};
use std::num::NonZeroUsize;

#[derive(Debug, Args)]
pub(super) struct SuiteOpts {
    /// Suite file to read [default: launchtest.toml]
    ///
    /// May be specified more than once to run several suites.
    #[arg(long = "suite", value_name = "PATH")]
    pub(super) suite_files: Vec<Utf8PathBuf>,

    /// Only run tests whose names contain a pattern
    ///
    /// May be specified more than once: a test is selected if it matches any pattern.
    #[arg(long = "filter", value_name = "PATTERN")]
    pub(super) filters: Vec<String>,
}

impl SuiteOpts {
    pub(super) fn suite_files(&self) -> Vec<Utf8PathBuf> {
        if self.suite_files.is_empty() {
            vec![Utf8PathBuf::from(SuiteConfig::DEFAULT_FILE_NAME)]
        } else {
            self.suite_files.clone()
        }
    }
}

#[derive(Debug, Args)]
pub(super) struct RunOpts {
    #[clap(flatten)]
    pub(super) suites: SuiteOpts,

    /// Print worker output as it is produced
    #[arg(long, help_heading = "RUNNER OPTIONS")]
    pub(super) stream_output: bool,

    /// Number of suites to run at the same time [default: 1]
    #[arg(
        long,
        short = 'j',
        value_name = "N",
        env = "LAUNCHTEST_JOBS",
        help_heading = "RUNNER OPTIONS"
    )]
    pub(super) jobs: Option<NonZeroUsize>,

    /// Behavior if there are no tests to run [default: fail]
    #[arg(
        long,
        value_enum,
        value_name = "ACTION",
        env = "LAUNCHTEST_NO_TESTS",
        help_heading = "RUNNER OPTIONS"
    )]
    pub(super) no_tests: Option<NoTestsBehavior>,

    /// Use the isolation id already set in the environment instead of leasing one
    ///
    /// The caller is then responsible for keeping concurrent runs apart.
    #[arg(long, help_heading = "RUNNER OPTIONS")]
    pub(super) inherit_isolation: bool,

    #[clap(flatten)]
    pub(super) results: ResultsDirOpts,
}

#[derive(Debug, Args)]
pub(super) struct ResultsDirOpts {
    /// Directory that reports are written to and read from
    #[arg(
        long,
        value_name = "DIR",
        env = "LAUNCHTEST_RESULTS_DIR",
        default_value = ResultsDir::DEFAULT_PATH,
    )]
    pub(super) results_dir: Utf8PathBuf,
}

#[derive(Debug, Args)]
pub(super) struct ShowResultsOpts {
    #[clap(flatten)]
    pub(super) results: ResultsDirOpts,

    /// Also list report files without errors or failures
    #[arg(long)]
    pub(super) all: bool,
}

#[derive(Debug, Args)]
pub(super) struct ListOpts {
    #[clap(flatten)]
    pub(super) suites: SuiteOpts,
}

/// What to do when no tests ran.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(super) enum NoTestsBehavior {
    /// Silently exit with code 0.
    Pass,

    /// Produce a warning and exit with code 0.
    Warn,

    /// Produce an error message and exit with code 4.
    #[clap(alias = "error")]
    Fail,
}
