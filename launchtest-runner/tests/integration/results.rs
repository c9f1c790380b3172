// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use launchtest_runner::{
    errors::TestRunnerBuildError,
    isolation::IsolationSettings,
    reporter::write_reports,
    runner::TestRunnerBuilder,
    signal::SignalHandlerKind,
    results::{ReportFileFormat, ResultsDir},
    routine::ExitCodes,
    suite::Suite,
};
use pretty_assertions::assert_eq;
use std::num::NonZeroUsize;

fn failing_suite(name: &str, port_base: u16) -> Result<Suite> {
    let mut builder = suite_builder(name, port_base);
    builder
        .worker(interruptible_worker("talker", 0))
        .post_shutdown_test(
            "exit_codes",
            ExitCodes {
                workers: None,
                allowed: Some(vec![7]),
            },
        );
    Ok(builder.build()?)
}

#[test]
fn written_reports_aggregate() -> Result<()> {
    let suites = vec![
        failing_suite("talker", 44000)?,
        failing_suite("listener", 44000)?,
    ];
    let (outcomes, _) = run_suites(suites, |builder| {
        builder.set_jobs(NonZeroUsize::new(2).expect("non-zero"));
    })?;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].report.suite, "talker");
    assert_eq!(outcomes[1].report.suite, "listener");

    let dir = Utf8TempDir::with_prefix("launchtest-results-")?;
    for outcome in &outcomes {
        let written = write_reports(dir.path(), &outcome.report)?;
        assert!(written.native.is_file());
        assert!(written.xunit.is_file());
    }
    std::fs::write(dir.path().join("stale.xunit.xml"), "<testsuites><testsuite")?;

    let aggregation = ResultsDir::new(dir.path()).aggregate();
    // Each run wrote a native and an XUnit report; the XUnit one is superseded.
    assert_eq!(aggregation.files.len(), 2);
    assert!(
        aggregation
            .files
            .iter()
            .all(|file| file.format == ReportFileFormat::Native)
    );
    assert_eq!(aggregation.superseded.len(), 2);
    assert_eq!(aggregation.unreadable.len(), 1);
    assert_eq!(
        aggregation.summary().to_string(),
        "2 tests, 0 errors, 2 failures, 0 skipped (1 unreadable result files)"
    );
    assert!(!aggregation.summary().is_success());
    Ok(())
}

const JOBS_ISOLATION_ENV_VAR: &str = "LAUNCHTEST_TEST_JOBS_ISOLATION_ID";

#[test]
fn concurrent_suites_lease_distinct_ids() -> Result<()> {
    // Both suites can take id 5, so the second one must move on to 6 while the first is live.
    let mut narrow = suite_builder("narrow", 44200);
    narrow
        .isolation(IsolationSettings::new(JOBS_ISOLATION_ENV_VAR, 5..=5, 44200))
        .worker(interruptible_worker("talker", 0));
    let mut wide = suite_builder("wide", 44200);
    wide.isolation(IsolationSettings::new(JOBS_ISOLATION_ENV_VAR, 5..=6, 44200))
        .worker(interruptible_worker("listener", 0));

    let (outcomes, _) = run_suites(vec![narrow.build()?, wide.build()?], |builder| {
        builder.set_jobs(NonZeroUsize::new(2).expect("non-zero"));
    })?;
    let ids: Vec<_> = outcomes
        .iter()
        .map(|outcome| outcome.report.isolation_id)
        .collect();
    assert_eq!(ids, [Some(5), Some(6)]);
    assert!(outcomes.iter().all(|outcome| outcome.launch_error.is_none()));
    Ok(())
}

#[test]
fn suites_sharing_a_variable_must_share_lock_ports() -> Result<()> {
    let mut first = suite_builder("first", 44300);
    first.isolation(IsolationSettings::new(JOBS_ISOLATION_ENV_VAR, 1..=5, 44300));
    let mut second = suite_builder("second", 44300);
    second.isolation(IsolationSettings::new(JOBS_ISOLATION_ENV_VAR, 1..=5, 44400));

    let error = TestRunnerBuilder::new()
        .build(vec![first.build()?, second.build()?], SignalHandlerKind::Noop)
        .expect_err("differing lock ports are rejected");
    assert!(
        matches!(
            &error,
            TestRunnerBuildError::ConflictingLockPorts {
                first_base: 44300,
                second_base: 44400,
                ..
            }
        ),
        "unexpected error: {error}"
    );
    Ok(())
}
