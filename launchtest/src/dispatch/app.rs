// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level application and command routing.

use super::{
    cli::{ListOpts, RunOpts, ShowResultsOpts},
    execution::{exec_list, exec_run, exec_show_results},
};
use crate::{
    Result,
    output::{OutputContext, OutputOpts, OutputWriter},
};
use clap::{Parser, Subcommand};
use launchtest_runner::signal::SignalHandlerKind;

/// Launch-style integration tests for long-running worker processes.
///
/// Starts the workers described by a suite file under an isolation id, runs tests against them
/// while they are live and after they shut down, and writes XUnit and native reports.
#[derive(Debug, Parser)]
#[command(
    version,
    bin_name = "launchtest",
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct LaunchtestApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl LaunchtestApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        self.exec_with(output, output_writer, SignalHandlerKind::Standard)
    }

    pub(crate) fn exec_with(
        self,
        output: OutputContext,
        output_writer: &mut OutputWriter,
        signal_handler: SignalHandlerKind,
    ) -> Result<i32> {
        match self.command {
            Command::RunTests(opts) => exec_run(opts, output, output_writer, signal_handler),
            Command::ShowResults(opts) => exec_show_results(opts, output, output_writer),
            Command::ListTests(opts) => exec_list(opts, output_writer),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tests of one or more suites
    ///
    /// Each suite runs under its own isolation id: workers are started, active tests run once the
    /// readiness delay has elapsed, workers are shut down, then post-shutdown tests run. A native
    /// and an XUnit report are written per suite to the results directory.
    RunTests(RunOpts),

    /// Summarize the reports in a results directory
    ///
    /// Reads every native (`.json`) and XUnit (`.xml`) report under the results directory and
    /// prints the files with errors or failures, followed by the totals.
    ShowResults(ShowResultsOpts),

    /// List the tests of one or more suites
    ListTests(ListOpts),
}
