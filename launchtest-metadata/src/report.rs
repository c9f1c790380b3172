// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::{error, fmt, time::Duration};

/// The current version of the native report format.
///
/// Readers reject reports with a different version.
pub const REPORT_FORMAT_VERSION: u32 = 1;

/// The file name of the native report, relative to a suite's results directory.
pub const NATIVE_REPORT_FILE_NAME: &str = "launchtest.json";

/// The file name of the XUnit report, relative to a suite's results directory.
pub const XUNIT_REPORT_FILE_NAME: &str = "launchtest.xunit.xml";

/// The phase a test case runs in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestPhase {
    /// The test runs while workers are still running.
    Active,

    /// The test runs after all workers have terminated.
    PostShutdown,
}

impl TestPhase {
    /// Returns the string used for this phase in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PostShutdown => "post-shutdown",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a single test case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestOutcome {
    /// The test passed.
    Pass,

    /// The test failed: an assertion did not hold, or the test timed out.
    Fail,

    /// The test errored: something unexpected happened while running it.
    Error,

    /// The test was not run.
    Skip,
}

impl TestOutcome {
    /// Returns true if this outcome counts against the run.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

/// Why a test case did not pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetailKind {
    /// An assertion in the test did not hold.
    Assertion,

    /// The test exceeded its timeout.
    Timeout,

    /// The test returned an unexpected error.
    Unexpected,

    /// The test panicked.
    Panic,

    /// The run was cancelled while the test was in flight.
    Cancelled,

    /// Workers failed to start, so the test could not run.
    Launch,

    /// The test did not match the filter.
    Filtered,

    /// The run was cancelled before the test started.
    NotRun,
}

impl DetailKind {
    /// Returns the string used for this kind in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assertion => "assertion",
            Self::Timeout => "timeout",
            Self::Unexpected => "unexpected",
            Self::Panic => "panic",
            Self::Cancelled => "cancelled",
            Self::Launch => "launch",
            Self::Filtered => "filtered",
            Self::NotRun => "not-run",
        }
    }
}

impl fmt::Display for DetailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail attached to a test case that did not pass.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureDetail {
    /// The kind of failure.
    pub kind: DetailKind,

    /// A one-line message.
    pub message: String,

    /// A longer description, for example an error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FailureDetail {
    /// Creates a new detail with no description.
    pub fn new(kind: DetailKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            description: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The result of a single test case. Created once the test completes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCaseSummary {
    /// The name of the test.
    pub name: String,

    /// The phase the test ran in.
    pub phase: TestPhase,

    /// The outcome.
    pub outcome: TestOutcome,

    /// The time the test took.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Failure detail, present for every outcome other than `pass`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureDetail>,
}

/// Aggregate counts for a set of test cases.
///
/// `tests` always equals `errors + failures + skipped + passed()`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunCounts {
    /// The total number of tests.
    pub tests: usize,

    /// The number of tests that errored.
    pub errors: usize,

    /// The number of tests that failed.
    pub failures: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,
}

impl RunCounts {
    /// Computes counts from a list of test cases.
    pub fn from_test_cases<'a>(test_cases: impl IntoIterator<Item = &'a TestCaseSummary>) -> Self {
        let mut counts = Self::default();
        for test_case in test_cases {
            counts.add_outcome(test_case.outcome);
        }
        counts
    }

    /// Records one test with the given outcome.
    pub fn add_outcome(&mut self, outcome: TestOutcome) {
        self.tests += 1;
        match outcome {
            TestOutcome::Pass => {}
            TestOutcome::Fail => self.failures += 1,
            TestOutcome::Error => self.errors += 1,
            TestOutcome::Skip => self.skipped += 1,
        }
    }

    /// Returns the number of passed tests, or `None` if the counts are inconsistent.
    pub fn checked_passed(&self) -> Option<usize> {
        self.tests
            .checked_sub(self.errors)?
            .checked_sub(self.failures)?
            .checked_sub(self.skipped)
    }

    /// Returns the number of passed tests.
    ///
    /// Inconsistent counts are treated as zero passed tests.
    pub fn passed(&self) -> usize {
        self.checked_passed().unwrap_or(0)
    }

    /// Returns the number of tests that ran, i.e. were not skipped.
    pub fn run(&self) -> usize {
        self.tests.saturating_sub(self.skipped)
    }

    /// Returns true if there are no errors or failures.
    pub fn is_success(&self) -> bool {
        self.errors == 0 && self.failures == 0
    }

    /// Adds two sets of counts, returning `None` if any count overflows.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            tests: self.tests.checked_add(other.tests)?,
            errors: self.errors.checked_add(other.errors)?,
            failures: self.failures.checked_add(other.failures)?,
            skipped: self.skipped.checked_add(other.skipped)?,
        })
    }
}

/// Addition saturates at `usize::MAX`.
impl std::ops::Add for RunCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            tests: self.tests.saturating_add(other.tests),
            errors: self.errors.saturating_add(other.errors),
            failures: self.failures.saturating_add(other.failures),
            skipped: self.skipped.saturating_add(other.skipped),
        }
    }
}

impl std::ops::AddAssign for RunCounts {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl fmt::Display for RunCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests, {} errors, {} failures, {} skipped",
            self.tests, self.errors, self.failures, self.skipped
        )
    }
}

/// The native report written for one isolated run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunReportSummary {
    /// The report format version, currently [`REPORT_FORMAT_VERSION`].
    pub format_version: u32,

    /// The name of the suite.
    pub suite: String,

    /// The unique identifier of this run.
    pub run_id: String,

    /// The isolation id the run executed under, if one was leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_id: Option<u32>,

    /// The time the run started.
    pub started_at: DateTime<FixedOffset>,

    /// The time the run took.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// If workers failed to start, the launch error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_error: Option<String>,

    /// If the run was cancelled, the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Aggregate counts over `test_cases`.
    #[serde(flatten)]
    pub counts: RunCounts,

    /// The test cases, in execution order.
    pub test_cases: Vec<TestCaseSummary>,
}

impl RunReportSummary {
    /// Creates a new report, computing counts from `test_cases`.
    pub fn new(
        suite: impl Into<String>,
        run_id: impl Into<String>,
        started_at: DateTime<FixedOffset>,
        duration: Duration,
        test_cases: Vec<TestCaseSummary>,
    ) -> Self {
        let counts = RunCounts::from_test_cases(&test_cases);
        Self {
            format_version: REPORT_FORMAT_VERSION,
            suite: suite.into(),
            run_id: run_id.into(),
            isolation_id: None,
            started_at,
            duration,
            launch_error: None,
            cancel_reason: None,
            counts,
            test_cases,
        }
    }

    /// Returns true if every test that ran passed and the run was neither cancelled nor failed to
    /// launch.
    pub fn is_success(&self) -> bool {
        self.counts.is_success() && self.launch_error.is_none() && self.cancel_reason.is_none()
    }

    /// Parses a report from JSON, checking the format version and the count invariants.
    pub fn parse(json: &str) -> Result<Self, ReportFormatError> {
        let report: Self = serde_json::from_str(json).map_err(ReportFormatError::Json)?;
        if report.format_version != REPORT_FORMAT_VERSION {
            return Err(ReportFormatError::UnsupportedVersion {
                found: report.format_version,
            });
        }
        report.check_counts()?;
        Ok(report)
    }

    /// Checks that the stored counts are consistent with each other and with the test cases.
    pub fn check_counts(&self) -> Result<(), ReportFormatError> {
        let computed = RunCounts::from_test_cases(&self.test_cases);
        if self.counts.checked_passed().is_none() || computed != self.counts {
            return Err(ReportFormatError::CountMismatch {
                stored: self.counts,
                computed,
            });
        }
        Ok(())
    }

    /// Serializes this report as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, ReportFormatError> {
        serde_json::to_string_pretty(self).map_err(ReportFormatError::Json)
    }
}

/// An error that occurs while reading or writing a native report.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReportFormatError {
    /// The JSON could not be parsed or produced.
    Json(serde_json::Error),

    /// The report was written in an unsupported format version.
    UnsupportedVersion {
        /// The version found in the report.
        found: u32,
    },

    /// The counts stored in the report don't match its test cases.
    CountMismatch {
        /// The counts stored in the report.
        stored: RunCounts,

        /// The counts computed from the test cases.
        computed: RunCounts,
    },
}

impl fmt::Display for ReportFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Json(_) => write!(f, "invalid report JSON"),
            Self::UnsupportedVersion { found } => write!(
                f,
                "unsupported report format version {found} (expected {REPORT_FORMAT_VERSION})"
            ),
            Self::CountMismatch { stored, computed } => write!(
                f,
                "report counts ({stored}) are inconsistent with its test cases ({computed})"
            ),
        }
    }
}

impl error::Error for ReportFormatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::UnsupportedVersion { .. } | Self::CountMismatch { .. } => None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub(super) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use proptest::prelude::*;
    use test_case::test_case;
    use test_strategy::proptest;

    fn test_case(name: &str, outcome: TestOutcome) -> TestCaseSummary {
        TestCaseSummary {
            name: name.to_owned(),
            phase: TestPhase::Active,
            outcome,
            duration: Duration::from_millis(250),
            detail: None,
        }
    }

    #[test]
    fn counts_add_up() {
        let cases = vec![
            test_case("a", TestOutcome::Pass),
            test_case("b", TestOutcome::Fail),
            test_case("c", TestOutcome::Error),
            test_case("d", TestOutcome::Skip),
            test_case("e", TestOutcome::Pass),
        ];
        let counts = RunCounts::from_test_cases(&cases);
        assert_eq!(
            counts,
            RunCounts {
                tests: 5,
                errors: 1,
                failures: 1,
                skipped: 1,
            }
        );
        assert_eq!(counts.passed(), 2);
        assert_eq!(counts.run(), 4);
        assert!(!counts.is_success());
        assert_eq!(
            counts.to_string(),
            "5 tests, 1 errors, 1 failures, 1 skipped"
        );
    }

    fn outcome_strategy() -> impl Strategy<Value = TestOutcome> {
        prop_oneof![
            Just(TestOutcome::Pass),
            Just(TestOutcome::Fail),
            Just(TestOutcome::Error),
            Just(TestOutcome::Skip),
        ]
    }

    // Durations are multiples of 125ms so they survive the float encoding exactly.
    fn test_cases_strategy() -> impl Strategy<Value = Vec<TestCaseSummary>> {
        prop::collection::vec((outcome_strategy(), any::<bool>(), 0..200u64), 0..40).prop_map(
            |cases| {
                cases
                    .into_iter()
                    .enumerate()
                    .map(|(index, (outcome, post_shutdown, eighths))| TestCaseSummary {
                        name: format!("test_{index}"),
                        phase: if post_shutdown {
                            TestPhase::PostShutdown
                        } else {
                            TestPhase::Active
                        },
                        outcome,
                        duration: Duration::from_millis(eighths * 125),
                        detail: (outcome != TestOutcome::Pass).then(|| {
                            FailureDetail::new(
                                DetailKind::Assertion,
                                format!("test_{index} did not pass"),
                            )
                        }),
                    })
                    .collect()
            },
        )
    }

    #[proptest]
    fn report_counts_add_up_and_survive_json(
        #[strategy(test_cases_strategy())] test_cases: Vec<TestCaseSummary>,
    ) {
        let passed = test_cases
            .iter()
            .filter(|test_case| test_case.outcome == TestOutcome::Pass)
            .count();
        let started_at =
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00").expect("valid timestamp");
        let report = RunReportSummary::new("s", "r", started_at, Duration::from_secs(1), test_cases);

        let counts = report.counts;
        prop_assert_eq!(counts.tests, report.test_cases.len());
        prop_assert_eq!(
            counts.tests,
            counts.errors + counts.failures + counts.skipped + passed
        );
        prop_assert_eq!(counts.checked_passed(), Some(passed));

        let json = report.to_json_pretty().expect("serialized");
        let parsed = RunReportSummary::parse(&json).expect("report parses");
        prop_assert_eq!(parsed, report);
    }

    #[test]
    fn checked_add_detects_overflow() {
        let max = RunCounts {
            tests: usize::MAX,
            errors: 0,
            failures: 0,
            skipped: 0,
        };
        let one = RunCounts {
            tests: 1,
            errors: 0,
            failures: 0,
            skipped: 0,
        };
        assert_eq!(max.checked_add(one), None);
        assert_eq!(max + one, max);
        assert_eq!(one.checked_add(one).map(|counts| counts.tests), Some(2));
    }

    #[test]
    fn parse_valid_report() {
        let json = indoc! {r#"
            {
              "format-version": 1,
              "suite": "talker",
              "run-id": "0b5e8b8c-1f9c-4c8b-9a55-0d3c2a1d8f00",
              "isolation-id": 7,
              "started-at": "2024-05-01T10:00:00+00:00",
              "duration": 1.5,
              "tests": 2,
              "errors": 0,
              "failures": 1,
              "skipped": 0,
              "test-cases": [
                { "name": "a", "phase": "active", "outcome": "pass", "duration": 0.5 },
                {
                  "name": "b",
                  "phase": "post-shutdown",
                  "outcome": "fail",
                  "duration": 0.25,
                  "detail": { "kind": "assertion", "message": "exit code 1" }
                }
              ]
            }
        "#};
        let report = RunReportSummary::parse(json).expect("valid report");
        assert_eq!(report.suite, "talker");
        assert_eq!(report.isolation_id, Some(7));
        assert_eq!(report.counts.failures, 1);
        assert_eq!(report.test_cases[1].phase, TestPhase::PostShutdown);
        assert_eq!(
            report.test_cases[1].detail.as_ref().map(|d| d.kind),
            Some(DetailKind::Assertion)
        );
        assert!(!report.is_success());

        let reparsed =
            RunReportSummary::parse(&report.to_json_pretty().expect("serialized")).unwrap();
        assert_eq!(report, reparsed);
    }

    #[test_case(
        r#""tests": 3, "errors": 0, "failures": 0, "skipped": 0"#
        ; "tests count too high"
    )]
    #[test_case(
        r#""tests": 1, "errors": 1, "failures": 1, "skipped": 0"#
        ; "more non-passing than total"
    )]
    fn parse_rejects_inconsistent_counts(counts: &str) {
        let json = format!(
            r#"{{
                "format-version": 1,
                "suite": "s",
                "run-id": "r",
                "started-at": "2024-05-01T10:00:00+00:00",
                "duration": 0.0,
                {counts},
                "test-cases": [
                    {{ "name": "a", "phase": "active", "outcome": "pass", "duration": 0.1 }}
                ]
            }}"#
        );
        let error = RunReportSummary::parse(&json).expect_err("counts are inconsistent");
        assert!(
            matches!(error, ReportFormatError::CountMismatch { .. }),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let json = r#"{
            "format-version": 2,
            "suite": "s",
            "run-id": "r",
            "started-at": "2024-05-01T10:00:00+00:00",
            "duration": 0.0,
            "tests": 0, "errors": 0, "failures": 0, "skipped": 0,
            "test-cases": []
        }"#;
        let error = RunReportSummary::parse(json).expect_err("version is unsupported");
        assert!(matches!(
            error,
            ReportFormatError::UnsupportedVersion { found: 2 }
        ));
    }

    #[test]
    fn parse_rejects_negative_duration() {
        let json = r#"{
            "format-version": 1,
            "suite": "s",
            "run-id": "r",
            "started-at": "2024-05-01T10:00:00+00:00",
            "duration": -1.0,
            "tests": 0, "errors": 0, "failures": 0, "skipped": 0,
            "test-cases": []
        }"#;
        assert!(matches!(
            RunReportSummary::parse(json),
            Err(ReportFormatError::Json(_))
        ));
    }
}
