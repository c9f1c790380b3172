// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregating persisted reports.
//!
//! [`ResultsDir`] finds native (`*.json`) and XUnit (`*.xml`) report files under a directory and
//! reads them into [`ResultFile`]s. Files that can't be read or parsed are excluded and counted as
//! unreadable. A native report and an XUnit report from the same run count once, preferring the
//! native report.

mod xunit;

pub use xunit::*;

use crate::errors::{ReportParseError, XunitParseError};
use camino::{Utf8Path, Utf8PathBuf};
use launchtest_metadata::{RunCounts, RunReportSummary, TestOutcome};
use std::{collections::HashSet, fmt, iter::Sum, ops::Add};
use tracing::{debug, warn};

/// The format of a report file, determined by its extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ReportFileFormat {
    /// A native JSON report.
    Native,

    /// An XUnit XML report.
    Xunit,
}

impl ReportFileFormat {
    /// Returns the format for a path, or `None` if the path isn't a report file.
    pub fn from_path(path: &Utf8Path) -> Option<Self> {
        match path.extension() {
            Some("json") => Some(Self::Native),
            Some("xml") => Some(Self::Xunit),
            _ => None,
        }
    }
}

impl fmt::Display for ReportFileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Xunit => f.write_str("xunit"),
        }
    }
}

/// A test case that did not pass, as read from a report file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NonPassingTest {
    /// The test name.
    pub name: String,

    /// The outcome.
    pub outcome: TestOutcome,

    /// The kind of failure, if recorded.
    pub kind: Option<String>,

    /// The failure message, if recorded.
    pub message: Option<String>,

    /// Further detail, if recorded.
    pub description: Option<String>,
}

/// A readable report file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultFile {
    /// The path.
    pub path: Utf8PathBuf,

    /// The format.
    pub format: ReportFileFormat,

    /// The run id, if the file carries one.
    pub run_id: Option<String>,

    /// The counts.
    pub counts: RunCounts,

    /// The test cases that did not pass.
    pub non_passing: Vec<NonPassingTest>,
}

impl ResultFile {
    /// Reads and parses a report file.
    pub fn read(path: &Utf8Path, format: ReportFileFormat) -> Result<Self, ReportParseError> {
        let contents = std::fs::read_to_string(path).map_err(|error| ReportParseError::Read {
            path: path.to_owned(),
            error,
        })?;
        match format {
            ReportFileFormat::Native => Self::parse_native(path, &contents),
            ReportFileFormat::Xunit => Self::parse_xunit(path, &contents),
        }
    }

    fn parse_native(path: &Utf8Path, contents: &str) -> Result<Self, ReportParseError> {
        let report =
            RunReportSummary::parse(contents).map_err(|error| ReportParseError::Native {
                path: path.to_owned(),
                error,
            })?;
        let non_passing = report
            .test_cases
            .into_iter()
            .filter(|test_case| test_case.outcome != TestOutcome::Pass)
            .map(|test_case| {
                let (kind, message, description) = match test_case.detail {
                    Some(detail) => (
                        Some(detail.kind.to_string()),
                        Some(detail.message),
                        detail.description,
                    ),
                    None => (None, None, None),
                };
                NonPassingTest {
                    name: test_case.name,
                    outcome: test_case.outcome,
                    kind,
                    message,
                    description,
                }
            })
            .collect();
        Ok(Self {
            path: path.to_owned(),
            format: ReportFileFormat::Native,
            run_id: Some(report.run_id),
            counts: report.counts,
            non_passing,
        })
    }

    fn parse_xunit(path: &Utf8Path, contents: &str) -> Result<Self, ReportParseError> {
        let report = parse_xunit(contents).map_err(|error| ReportParseError::Xunit {
            path: path.to_owned(),
            error,
        })?;
        let counts = report.counts().ok_or_else(|| ReportParseError::Xunit {
            path: path.to_owned(),
            error: XunitParseError::CountOverflow,
        })?;
        let non_passing = report
            .suites
            .into_iter()
            .flat_map(|suite| suite.non_passing)
            .map(|test_case| NonPassingTest {
                name: test_case.name,
                outcome: test_case.outcome,
                kind: test_case.kind,
                message: test_case.message,
                description: test_case.description,
            })
            .collect();
        Ok(Self {
            path: path.to_owned(),
            format: ReportFileFormat::Xunit,
            run_id: report.run_id,
            counts,
            non_passing,
        })
    }

    /// Returns true if the file records any errors or failures.
    pub fn has_failures(&self) -> bool {
        !self.counts.is_success()
    }
}

/// Totals over a set of report files. Derived on each aggregation and never persisted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Summary {
    /// The summed counts of all readable files.
    pub counts: RunCounts,

    /// The number of files that couldn't be read.
    pub unreadable: usize,
}

impl Summary {
    /// Returns a summary for one readable file.
    pub fn from_counts(counts: RunCounts) -> Self {
        Self {
            counts,
            unreadable: 0,
        }
    }

    /// Returns a summary for one unreadable file.
    pub fn unreadable() -> Self {
        Self {
            counts: RunCounts::default(),
            unreadable: 1,
        }
    }

    /// Merges two summaries. Merging is commutative and associative.
    pub fn merge(self, other: Self) -> Self {
        Self {
            counts: self.counts + other.counts,
            unreadable: self.unreadable.saturating_add(other.unreadable),
        }
    }

    /// Returns true if no readable file records errors or failures.
    pub fn is_success(&self) -> bool {
        self.counts.is_success()
    }
}

impl Add for Summary {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        self.merge(other)
    }
}

impl Sum for Summary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Self::merge)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.counts)?;
        if self.unreadable > 0 {
            write!(f, " ({} unreadable result files)", self.unreadable)?;
        }
        Ok(())
    }
}

/// The result of reading a results directory.
#[derive(Debug, Default)]
pub struct Aggregation {
    /// Readable files, sorted by path. Files superseded by another report of the same run are
    /// not included.
    pub files: Vec<ResultFile>,

    /// Files that were read, but superseded by another report of the same run.
    pub superseded: Vec<Utf8PathBuf>,

    /// Files that couldn't be read, sorted by path.
    pub unreadable: Vec<ReportParseError>,
}

impl Aggregation {
    /// Builds an aggregation from read results, in any order.
    pub fn from_results(results: impl IntoIterator<Item = Result<ResultFile, ReportParseError>>) -> Self {
        let mut files = Vec::new();
        let mut unreadable = Vec::new();
        for result in results {
            match result {
                Ok(file) => files.push(file),
                Err(error) => unreadable.push(error),
            }
        }

        // Within a run id, native reports sort first, then by path.
        files.sort_by(|a, b| {
            (&a.run_id, a.format, &a.path).cmp(&(&b.run_id, b.format, &b.path))
        });
        let mut seen = HashSet::new();
        let mut superseded = Vec::new();
        files.retain(|file| match &file.run_id {
            Some(run_id) if !seen.insert(run_id.clone()) => {
                debug!(path = %file.path, %run_id, "report superseded by another report of the same run");
                superseded.push(file.path.clone());
                false
            }
            _ => true,
        });

        files.sort_by(|a, b| a.path.cmp(&b.path));
        superseded.sort();
        unreadable.sort_by(|a, b| a.path().cmp(b.path()));
        Self {
            files,
            superseded,
            unreadable,
        }
    }

    /// Returns the summary over all files.
    pub fn summary(&self) -> Summary {
        self.files
            .iter()
            .map(|file| Summary::from_counts(file.counts))
            .chain(self.unreadable.iter().map(|_| Summary::unreadable()))
            .sum()
    }
}

/// A directory of persisted reports.
#[derive(Clone, Debug)]
pub struct ResultsDir {
    root: Utf8PathBuf,
}

impl ResultsDir {
    /// The default results directory, relative to the current directory.
    pub const DEFAULT_PATH: &'static str = "test_results";

    /// Creates a new `ResultsDir`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root of the directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Finds report files under the directory, sorted by path.
    ///
    /// A missing directory has no report files. Entries that can't be walked are returned as
    /// errors.
    pub fn discover(&self) -> Vec<Result<(Utf8PathBuf, ReportFileFormat), ReportParseError>> {
        if !self.root.exists() {
            debug!(root = %self.root, "results directory does not exist");
            return Vec::new();
        }

        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    let Some(path) = error.path().and_then(Utf8Path::from_path) else {
                        warn!(%error, "skipping unreadable entry in results directory");
                        continue;
                    };
                    let path = path.to_owned();
                    found.push(Err(ReportParseError::Read {
                        path,
                        error: error.into(),
                    }));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 path");
                continue;
            };
            // Temporary files from in-progress atomic writes.
            if path.file_name().is_some_and(|name| name.starts_with('.')) {
                continue;
            }
            if let Some(format) = ReportFileFormat::from_path(path) {
                found.push(Ok((path.to_owned(), format)));
            }
        }
        found
    }

    /// Reads every report file under the directory.
    pub fn aggregate(&self) -> Aggregation {
        let results = self.discover().into_iter().map(|found| {
            let (path, format) = found?;
            ResultFile::read(&path, format)
        });
        let aggregation = Aggregation::from_results(results);
        for error in &aggregation.unreadable {
            warn!("{}", crate::errors::DisplayErrorChain::new(error));
        }
        aggregation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn counts_strategy() -> impl Strategy<Value = RunCounts> {
        (0..1000usize, 0..100usize, 0..100usize, 0..100usize).prop_map(
            |(tests, errors, failures, skipped)| RunCounts {
                tests,
                errors,
                failures,
                skipped,
            },
        )
    }

    fn summary_strategy() -> impl Strategy<Value = Summary> {
        (counts_strategy(), 0..10usize).prop_map(|(counts, unreadable)| Summary {
            counts,
            unreadable,
        })
    }

    #[proptest]
    fn merge_is_commutative(
        #[strategy(summary_strategy())] a: Summary,
        #[strategy(summary_strategy())] b: Summary,
    ) {
        prop_assert_eq!(a.merge(b), b.merge(a));
    }

    #[proptest]
    fn merge_is_associative(
        #[strategy(summary_strategy())] a: Summary,
        #[strategy(summary_strategy())] b: Summary,
        #[strategy(summary_strategy())] c: Summary,
    ) {
        prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
    }

    fn file(path: &str, format: ReportFileFormat, run_id: Option<&str>, failures: usize) -> ResultFile {
        ResultFile {
            path: path.into(),
            format,
            run_id: run_id.map(str::to_owned),
            counts: RunCounts {
                tests: 2,
                errors: 0,
                failures,
                skipped: 0,
            },
            non_passing: Vec::new(),
        }
    }

    #[test]
    fn same_run_counts_once_preferring_native() {
        let files = vec![
            file("r/a/launchtest.xunit.xml", ReportFileFormat::Xunit, Some("run-1"), 1),
            file("r/a/launchtest.json", ReportFileFormat::Native, Some("run-1"), 1),
            file("r/b/results.xml", ReportFileFormat::Xunit, None, 0),
        ];
        let forward = Aggregation::from_results(files.clone().into_iter().map(Ok));
        let backward = Aggregation::from_results(files.into_iter().rev().map(Ok));

        for aggregation in [&forward, &backward] {
            let paths: Vec<_> = aggregation.files.iter().map(|file| file.path.as_str()).collect();
            assert_eq!(paths, ["r/a/launchtest.json", "r/b/results.xml"]);
            assert_eq!(aggregation.superseded, [Utf8PathBuf::from("r/a/launchtest.xunit.xml")]);
        }
        assert_eq!(forward.summary(), backward.summary());
        assert_eq!(
            forward.summary().to_string(),
            "4 tests, 0 errors, 1 failures, 0 skipped"
        );
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let results = ResultsDir::new(dir.path().join("does-not-exist"));
        let aggregation = results.aggregate();
        assert!(aggregation.files.is_empty());
        assert_eq!(aggregation.summary(), Summary::default());
    }

    #[test]
    fn malformed_files_are_unreadable() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        std::fs::write(dir.path().join("broken.json"), "{ not json").expect("wrote file");
        std::fs::write(dir.path().join("broken.xml"), "<testsuite>").expect("wrote file");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("wrote file");
        std::fs::write(
            dir.path().join("ok.xml"),
            r#"<testsuite name="s" tests="1" failures="1"><testcase name="t"><failure/></testcase></testsuite>"#,
        )
        .expect("wrote file");

        let aggregation = ResultsDir::new(dir.path()).aggregate();
        let summary = aggregation.summary();
        assert_eq!(summary.unreadable, 2);
        assert_eq!(
            summary.to_string(),
            "1 tests, 0 errors, 1 failures, 0 skipped (2 unreadable result files)"
        );
        assert!(!summary.is_success());
        assert_eq!(aggregation.files[0].non_passing[0].name, "t");
    }

    #[test]
    fn huge_counts_saturate_across_files() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let xml = format!(r#"<testsuite name="s" tests="{}" failures="0"/>"#, usize::MAX);
        std::fs::write(dir.path().join("a.xml"), &xml).expect("wrote file");
        std::fs::write(dir.path().join("b.xml"), &xml).expect("wrote file");

        let aggregation = ResultsDir::new(dir.path()).aggregate();
        assert_eq!(aggregation.files.len(), 2);
        let summary = aggregation.summary();
        assert_eq!(summary.counts.tests, usize::MAX);
        assert_eq!(summary.unreadable, 0);
        assert!(summary.is_success());
    }

    #[test]
    fn overflowing_suites_in_one_file_are_unreadable() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let xml = format!(
            r#"<testsuites><testsuite name="a" tests="{max}"/><testsuite name="b" tests="1"/></testsuites>"#,
            max = usize::MAX,
        );
        std::fs::write(dir.path().join("huge.xml"), xml).expect("wrote file");

        let aggregation = ResultsDir::new(dir.path()).aggregate();
        assert!(aggregation.files.is_empty());
        assert!(matches!(
            aggregation.unreadable.as_slice(),
            [ReportParseError::Xunit {
                error: XunitParseError::CountOverflow,
                ..
            }]
        ));
        assert_eq!(aggregation.summary().unreadable, 1);
    }
}
