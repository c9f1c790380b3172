// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ReportWriteError;
use camino::{Utf8Path, Utf8PathBuf};
use launchtest_metadata::{
    NATIVE_REPORT_FILE_NAME, RunReportSummary, TestCaseSummary, TestOutcome, TestPhase,
    XUNIT_REPORT_FILE_NAME,
};
use quick_junit::{NonSuccessKind, Property, Report, ReportUuid, TestCase, TestCaseStatus, TestSuite};
use std::io::Write;
use tracing::debug;

/// The name of the XUnit property that carries the run id.
pub const RUN_ID_PROPERTY: &str = "launchtest.run-id";

/// The paths written by [`write_reports`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WrittenReports {
    /// The native JSON report.
    pub native: Utf8PathBuf,

    /// The XUnit report.
    pub xunit: Utf8PathBuf,
}

/// Writes the native and XUnit reports for a run to `<results_dir>/<suite>/`.
///
/// Each file is replaced atomically, so readers never observe a partial report.
pub fn write_reports(
    results_dir: &Utf8Path,
    report: &RunReportSummary,
) -> Result<WrittenReports, ReportWriteError> {
    let suite_dir = results_dir.join(&report.suite);
    std::fs::create_dir_all(&suite_dir).map_err(|error| ReportWriteError::Fs {
        path: suite_dir.clone(),
        error,
    })?;

    let native = suite_dir.join(NATIVE_REPORT_FILE_NAME);
    let json = report
        .to_json_pretty()
        .map_err(|error| ReportWriteError::Native {
            path: native.clone(),
            error,
        })?;
    write_atomic(&native, json.as_bytes())?;

    let xunit = suite_dir.join(XUNIT_REPORT_FILE_NAME);
    let mut xml = Vec::new();
    to_xunit(report)
        .serialize(&mut xml)
        .map_err(|error| ReportWriteError::Xunit {
            path: xunit.clone(),
            error,
        })?;
    write_atomic(&xunit, &xml)?;

    debug!(%native, %xunit, "wrote reports");
    Ok(WrittenReports { native, xunit })
}

fn write_atomic(path: &Utf8Path, contents: &[u8]) -> Result<(), ReportWriteError> {
    atomicwrites::AtomicFile::new(path, atomicwrites::AllowOverwrite)
        .write(|file| file.write_all(contents))
        .map_err(|error| ReportWriteError::Fs {
            path: path.to_owned(),
            error: match error {
                atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => error,
            },
        })
}

/// Converts a run into an XUnit report with one `<testsuite>` per phase.
pub fn to_xunit(report: &RunReportSummary) -> Report {
    let mut xunit = Report::new(report.suite.as_str());
    xunit
        .set_timestamp(report.started_at)
        .set_time(report.duration);
    let uuid = report.run_id.parse::<ReportUuid>().ok();
    if let Some(uuid) = uuid {
        xunit.set_report_uuid(uuid);
    }

    let suites = [TestPhase::Active, TestPhase::PostShutdown].map(|phase| {
        let mut suite = TestSuite::new(format!("{}.{}", report.suite, phase.as_str()));
        suite
            .set_timestamp(report.started_at)
            .add_property(Property::new(RUN_ID_PROPERTY, report.run_id.as_str()));
        if let Some(id) = report.isolation_id {
            suite.add_property(Property::new("launchtest.isolation-id", id.to_string()));
        }
        let test_cases = report
            .test_cases
            .iter()
            .filter(|test_case| test_case.phase == phase)
            .map(|test_case| to_xunit_test_case(&report.suite, test_case));
        suite.add_test_cases(test_cases);
        suite
    });
    xunit.add_test_suites(suites);
    xunit
}

fn to_xunit_test_case(classname: &str, test_case: &TestCaseSummary) -> TestCase {
    let mut status = match test_case.outcome {
        TestOutcome::Pass => TestCaseStatus::success(),
        TestOutcome::Fail => TestCaseStatus::non_success(NonSuccessKind::Failure),
        TestOutcome::Error => TestCaseStatus::non_success(NonSuccessKind::Error),
        TestOutcome::Skip => TestCaseStatus::skipped(),
    };
    if let Some(detail) = &test_case.detail {
        status.set_type(detail.kind.as_str()).set_message(detail.message.as_str());
        if let Some(description) = &detail.description {
            status.set_description(description.as_str());
        }
    }

    let mut xunit = TestCase::new(test_case.name.as_str(), status);
    xunit.set_classname(classname).set_time(test_case.duration);
    xunit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::parse_xunit;
    use camino_tempfile::Utf8TempDir;
    use chrono::DateTime;
    use launchtest_metadata::{DetailKind, FailureDetail, RunCounts};
    use proptest::prelude::*;
    use std::time::Duration;
    use test_strategy::proptest;

    fn sample_report() -> RunReportSummary {
        let started_at =
            DateTime::parse_from_rfc3339("2024-05-01T12:00:00+02:00").expect("valid timestamp");
        let test_cases = vec![
            TestCaseSummary {
                name: "talker_logs".to_owned(),
                phase: TestPhase::Active,
                outcome: TestOutcome::Pass,
                duration: Duration::from_millis(125),
                detail: None,
            },
            TestCaseSummary {
                name: "exit_codes".to_owned(),
                phase: TestPhase::PostShutdown,
                outcome: TestOutcome::Fail,
                duration: Duration::from_millis(250),
                detail: Some(FailureDetail::new(
                    DetailKind::Assertion,
                    "worker `talker` exited with code 1 (allowed: [0])",
                )),
            },
        ];
        let mut report = RunReportSummary::new(
            "talker-listener",
            ReportUuid::new_v4().to_string(),
            started_at,
            Duration::from_secs(2),
            test_cases,
        );
        report.isolation_id = Some(7);
        report
    }

    #[test]
    fn xunit_has_one_suite_per_phase() {
        let report = sample_report();
        let xml = to_xunit(&report).to_string().expect("serializes");
        assert!(xml.contains(r#"<testsuite name="talker-listener.active" tests="1""#), "{xml}");
        assert!(
            xml.contains(r#"<testsuite name="talker-listener.post-shutdown" tests="1""#),
            "{xml}"
        );
        assert!(xml.contains(&report.run_id), "{xml}");
        assert!(xml.contains(r#"type="assertion""#), "{xml}");
    }

    fn test_case_strategy() -> impl Strategy<Value = (TestPhase, TestOutcome)> {
        let phase = prop_oneof![Just(TestPhase::Active), Just(TestPhase::PostShutdown)];
        let outcome = prop_oneof![
            Just(TestOutcome::Pass),
            Just(TestOutcome::Fail),
            Just(TestOutcome::Error),
            Just(TestOutcome::Skip),
        ];
        (phase, outcome)
    }

    #[proptest]
    fn xunit_rereads_to_the_same_counts(
        #[strategy(prop::collection::vec(test_case_strategy(), 0..40))] cases: Vec<(
            TestPhase,
            TestOutcome,
        )>,
    ) {
        let mut report = sample_report();
        report.test_cases = cases
            .into_iter()
            .enumerate()
            .map(|(index, (phase, outcome))| TestCaseSummary {
                name: format!("test_{index}"),
                phase,
                outcome,
                duration: Duration::from_millis(10),
                detail: (outcome != TestOutcome::Pass)
                    .then(|| FailureDetail::new(DetailKind::Unexpected, "did not pass")),
            })
            .collect();
        report.counts = RunCounts::from_test_cases(&report.test_cases);

        let xml = to_xunit(&report).to_string().expect("serializes");
        let parsed = parse_xunit(&xml).expect("written XUnit parses");
        prop_assert_eq!(parsed.counts(), Some(report.counts));
        prop_assert_eq!(parsed.run_id.as_deref(), Some(report.run_id.as_str()));
    }

    #[test]
    fn reports_are_written_per_suite() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let report = sample_report();
        let written = write_reports(dir.path(), &report).expect("reports written");
        assert_eq!(
            written.native,
            dir.path().join("talker-listener").join(NATIVE_REPORT_FILE_NAME)
        );

        let json = std::fs::read_to_string(&written.native).expect("native report readable");
        let parsed = RunReportSummary::parse(&json).expect("native report parses");
        assert_eq!(parsed, report);
        assert!(written.xunit.exists());

        // Rewriting replaces the previous report.
        write_reports(dir.path(), &report).expect("reports rewritten");
    }
}
