// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::eyre::{Result, eyre};
use launchtest_metadata::TestCaseSummary;
use launchtest_runner::{
    isolation::IsolationSettings,
    launcher::{ShutdownSettings, WorkerSpec},
    reporter::events::RunEvent,
    runner::{SuiteRunOutcome, TestRunnerBuilder},
    signal::SignalHandlerKind,
    suite::{Suite, SuiteBuilder, SuiteSettings},
};
use std::time::Duration;

pub(crate) const ISOLATION_ENV_VAR: &str = "LAUNCHTEST_TEST_ISOLATION_ID";

/// A worker that runs an `sh` script.
pub(crate) fn sh_worker(name: &str, script: &str) -> WorkerSpec {
    WorkerSpec::new(name, "sh").args(["-c", script])
}

/// A worker that prints `ready`, then runs until interrupted and exits with `code`.
pub(crate) fn interruptible_worker(name: &str, code: i32) -> WorkerSpec {
    sh_worker(
        name,
        &format!("trap 'exit {code}' INT; echo ready; while true; do sleep 0.1; done"),
    )
}

/// Starts a suite with fast timings.
///
/// Each test passes its own `port_base` so that its lock ports don't clash with other test
/// binaries running at the same time.
pub(crate) fn suite_builder(name: &str, port_base: u16) -> SuiteBuilder {
    let mut builder = Suite::builder(name);
    builder
        .settings(SuiteSettings {
            ready_delay: Duration::from_millis(300),
            test_timeout: Duration::from_secs(20),
            global_timeout: None,
        })
        .isolation(IsolationSettings::new(ISOLATION_ENV_VAR, 1..=20, port_base))
        .shutdown(ShutdownSettings {
            sigint_grace: Duration::from_secs(5),
            sigterm_grace: Duration::from_secs(1),
        });
    builder
}

/// Runs suites to completion, returning the outcomes and every event.
pub(crate) fn run_suites(
    suites: Vec<Suite>,
    configure: impl FnOnce(&mut TestRunnerBuilder),
) -> Result<(Vec<SuiteRunOutcome>, Vec<RunEvent>)> {
    let mut builder = TestRunnerBuilder::new();
    configure(&mut builder);
    let runner = builder.build(suites, SignalHandlerKind::Noop)?;
    let mut events = Vec::new();
    let outcomes = runner.execute(|event| events.push(event));
    Ok((outcomes, events))
}

pub(crate) fn test_case<'a>(
    outcome: &'a SuiteRunOutcome,
    name: &str,
) -> Result<&'a TestCaseSummary> {
    outcome
        .report
        .test_cases
        .iter()
        .find(|test_case| test_case.name == name)
        .ok_or_else(|| eyre!("test case `{name}` not found in report"))
}
