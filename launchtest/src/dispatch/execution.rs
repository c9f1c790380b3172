// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::cli::{ListOpts, NoTestsBehavior, RunOpts, ShowResultsOpts, SuiteOpts};
use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputWriter},
};
use launchtest_metadata::{LaunchtestExitCode, TestOutcome, TestPhase};
use launchtest_runner::{
    config::{DefaultConfigWarnings, SuiteConfig},
    errors::LaunchError,
    reporter::{Displayer, write_reports},
    results::{Aggregation, ResultsDir},
    runner::{IsolationSource, SuiteRunOutcome, TestRunnerBuilder},
    signal::SignalHandlerKind,
    suite::Suite,
    test_filter::TestFilter,
};
use owo_colors::{OwoColorize, Style, style};
use std::io::{self, Write};
use tracing::{debug, warn};

pub(super) fn exec_run(
    opts: RunOpts,
    output: OutputContext,
    output_writer: &mut OutputWriter,
    signal_handler: SignalHandlerKind,
) -> Result<i32> {
    let filter = TestFilter::new(&opts.suites.filters)?;
    let suites = load_suites(&opts.suites)?;

    let mut builder = TestRunnerBuilder::new();
    builder
        .set_filter(filter)
        .set_stream_output(opts.stream_output);
    if let Some(jobs) = opts.jobs {
        builder.set_jobs(jobs);
    }
    if opts.inherit_isolation {
        builder.set_isolation_source(IsolationSource::Inherit);
    }
    let runner = builder.build(suites, signal_handler)?;

    let mut displayer = Displayer::new();
    if output.color.should_colorize(supports_color::Stream::Stderr) {
        displayer.colorize();
    }
    displayer.set_show_filtered(output.verbose);

    let mut stderr = output_writer.stderr_writer();
    let mut display_error = None;
    let outcomes = runner.execute(|event| {
        if display_error.is_some() {
            return;
        }
        if let Err(error) = displayer
            .write_event(&event, &mut stderr)
            .and_then(|()| stderr.flush())
        {
            display_error = Some(error);
        }
    });

    // Reports are written even if the terminal went away.
    let mut write_error = None;
    for outcome in &outcomes {
        match write_reports(&opts.results.results_dir, &outcome.report) {
            Ok(written) => {
                debug!(
                    suite = %outcome.report.suite,
                    native = %written.native,
                    xunit = %written.xunit,
                    "wrote reports",
                );
            }
            Err(error) if write_error.is_none() => write_error = Some(error),
            Err(error) => warn!("{error}"),
        }
    }
    if let Some(error) = display_error {
        return Err(ExpectedError::write_output_error(error));
    }
    if let Some(err) = write_error {
        return Err(ExpectedError::ReportWriteError { err });
    }

    final_exit_code(&outcomes, opts.no_tests)
}

/// Decides the exit code of `run-tests` from the outcome of every suite.
///
/// Setup problems take precedence over launch failures, which take precedence over test failures.
fn final_exit_code(outcomes: &[SuiteRunOutcome], no_tests: Option<NoTestsBehavior>) -> Result<i32> {
    let suites_where = |pred: fn(&LaunchError) -> bool| -> Vec<String> {
        outcomes
            .iter()
            .filter(|outcome| outcome.launch_error.as_ref().is_some_and(pred))
            .map(|outcome| outcome.report.suite.clone())
            .collect()
    };

    let suites = suites_where(|error| matches!(error, LaunchError::Isolation(_)));
    if !suites.is_empty() {
        return Err(ExpectedError::IsolationFailed { suites });
    }
    let suites = suites_where(|error| !matches!(error, LaunchError::Isolation(_)));
    if !suites.is_empty() {
        return Err(ExpectedError::LaunchFailed { suites });
    }
    if outcomes.iter().any(|outcome| !outcome.is_success()) {
        return Err(ExpectedError::TestRunFailed);
    }

    let run_count: usize = outcomes
        .iter()
        .map(|outcome| {
            let counts = outcome.report.counts;
            counts.tests.saturating_sub(counts.skipped)
        })
        .sum();
    if run_count == 0 {
        return match no_tests {
            Some(NoTestsBehavior::Pass) => Ok(LaunchtestExitCode::OK),
            Some(NoTestsBehavior::Warn) => {
                warn!("no tests to run");
                Ok(LaunchtestExitCode::OK)
            }
            Some(NoTestsBehavior::Fail) | None => Err(ExpectedError::NoTestsRun),
        };
    }

    Ok(LaunchtestExitCode::OK)
}

pub(super) fn exec_list(opts: ListOpts, output_writer: &mut OutputWriter) -> Result<i32> {
    let filter = TestFilter::new(&opts.suites.filters)?;
    let suites = load_suites(&opts.suites)?;

    let mut stdout = output_writer.stdout_writer();
    write_test_list(&suites, &filter, &mut stdout)
        .and_then(|()| stdout.flush())
        .map_err(ExpectedError::write_output_error)?;
    Ok(LaunchtestExitCode::OK)
}

fn write_test_list(suites: &[Suite], filter: &TestFilter, writer: &mut dyn Write) -> io::Result<()> {
    for suite in suites {
        writeln!(writer, "{}:", suite.name())?;
        for phase in [TestPhase::Active, TestPhase::PostShutdown] {
            let mut names = suite
                .test_names()
                .filter(|&(name, test_phase)| test_phase == phase && filter.matches(name))
                .peekable();
            if names.peek().is_none() {
                continue;
            }
            writeln!(writer, "    {phase}:")?;
            for (name, _) in names {
                writeln!(writer, "        {name}")?;
            }
        }
    }
    Ok(())
}

pub(super) fn exec_show_results(
    opts: ShowResultsOpts,
    output: OutputContext,
    output_writer: &mut OutputWriter,
) -> Result<i32> {
    let results_dir = ResultsDir::new(opts.results.results_dir);
    if results_dir.root().exists() && !results_dir.root().is_dir() {
        return Err(ExpectedError::ResultsDirInvalid {
            results_dir: results_dir.root().to_owned(),
        });
    }
    let aggregation = results_dir.aggregate();

    let mut styles = ResultStyles::default();
    if output.color.should_colorize(supports_color::Stream::Stdout) {
        styles.colorize();
    }
    let mut stdout = output_writer.stdout_writer();
    write_results(&aggregation, opts.all, output.verbose, &styles, &mut stdout)
        .and_then(|()| stdout.flush())
        .map_err(ExpectedError::write_output_error)?;

    if aggregation.summary().is_success() {
        Ok(LaunchtestExitCode::OK)
    } else {
        Ok(LaunchtestExitCode::TEST_RUN_FAILED)
    }
}

fn write_results(
    aggregation: &Aggregation,
    all: bool,
    verbose: bool,
    styles: &ResultStyles,
    writer: &mut dyn Write,
) -> io::Result<()> {
    for file in &aggregation.files {
        let failed = file.has_failures();
        if !failed && !all {
            continue;
        }
        let status = if failed {
            "FAIL".style(styles.fail)
        } else {
            "PASS".style(styles.pass)
        };
        writeln!(
            writer,
            "{:>12} {} ({}): {}",
            status, file.path, file.format, file.counts
        )?;

        if !verbose {
            continue;
        }
        for test in &file.non_passing {
            let (label, style) = match test.outcome {
                TestOutcome::Fail => ("FAIL", styles.fail),
                TestOutcome::Error => ("ERROR", styles.fail),
                TestOutcome::Skip if all => ("SKIP", styles.skip),
                TestOutcome::Skip | TestOutcome::Pass => continue,
            };
            writeln!(writer, "{:>16} {}", label.style(style), test.name)?;
            let message = match (&test.kind, &test.message) {
                (Some(kind), Some(message)) => Some(format!("{kind}: {message}")),
                (Some(text), None) | (None, Some(text)) => Some(text.clone()),
                (None, None) => None,
            };
            if let Some(message) = message {
                writeln!(writer, "{:>17}{message}", "")?;
            }
            if let Some(description) = &test.description {
                for line in description.lines() {
                    writeln!(writer, "{:>19}{line}", "")?;
                }
            }
        }
    }

    for error in &aggregation.unreadable {
        writeln!(writer, "{:>12} {}", "UNREADABLE".style(styles.fail), error.path())?;
    }

    writeln!(
        writer,
        "{}: {}",
        "Summary".style(styles.summary),
        aggregation.summary()
    )
}

fn load_suites(opts: &SuiteOpts) -> Result<Vec<Suite>> {
    let mut suites: Vec<Suite> = Vec::new();
    for suite_file in opts.suite_files() {
        let suite = SuiteConfig::from_path(suite_file, &mut DefaultConfigWarnings)?.into_suite();
        if suites.iter().any(|other| other.name() == suite.name()) {
            warn!(
                "suite `{}` is named more than once, so its reports will overwrite each other",
                suite.name()
            );
        }
        suites.push(suite);
    }
    Ok(suites)
}

#[derive(Debug, Default)]
struct ResultStyles {
    pass: Style,
    fail: Style,
    skip: Style,
    summary: Style,
}

impl ResultStyles {
    fn colorize(&mut self) {
        self.pass = style().green().bold();
        self.fail = style().red().bold();
        self.skip = style().yellow().bold();
        self.summary = style().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LaunchtestApp;
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use clap::Parser;
    use indoc::{formatdoc, indoc};
    use launchtest_metadata::{DetailKind, FailureDetail, RunReportSummary, TestCaseSummary};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn exec(args: &[&str], verbose: bool) -> (Result<i32>, OutputWriter) {
        let app = LaunchtestApp::try_parse_from(args).expect("arguments are valid");
        let mut writer = OutputWriter::new_test();
        let result = app.exec_with(
            OutputContext::for_test(verbose),
            &mut writer,
            SignalHandlerKind::Noop,
        );
        (result, writer)
    }

    fn test_case(name: &str, outcome: TestOutcome, detail: Option<FailureDetail>) -> TestCaseSummary {
        TestCaseSummary {
            name: name.to_owned(),
            phase: TestPhase::Active,
            outcome,
            duration: Duration::from_millis(500),
            detail,
        }
    }

    fn write_report(dir: &Utf8Path, suite: &str, run_id: &str, test_cases: Vec<TestCaseSummary>) {
        let report = RunReportSummary::new(
            suite,
            run_id,
            chrono::Local::now().fixed_offset(),
            Duration::from_secs(3),
            test_cases,
        );
        write_reports(dir, &report).expect("reports are written");
    }

    fn populated_results_dir() -> Utf8TempDir {
        let dir = Utf8TempDir::with_prefix("launchtest-show-").expect("temp dir created");
        write_report(
            dir.path(),
            "listener",
            "b5a1c8e2-6a41-4f0e-9d39-0d5ab6e0a7c2",
            vec![
                test_case("listener_logs", TestOutcome::Pass, None),
                test_case(
                    "chatter_rate",
                    TestOutcome::Fail,
                    Some(FailureDetail::new(
                        DetailKind::Assertion,
                        "expected at least 101 messages, received 50",
                    )),
                ),
                test_case(
                    "filtered_out",
                    TestOutcome::Skip,
                    Some(FailureDetail::new(DetailKind::Filtered, "excluded by filter")),
                ),
            ],
        );
        write_report(
            dir.path(),
            "talker",
            "1f0e7a53-03b4-4c49-8c07-7d2f0d2c9a11",
            vec![test_case("talker_logs", TestOutcome::Pass, None)],
        );
        dir
    }

    #[test]
    fn show_results_lists_failing_files() {
        let dir = populated_results_dir();
        let (result, writer) = exec(
            &["launchtest", "show-results", "--results-dir", dir.path().as_str()],
            false,
        );
        assert_eq!(
            result.expect("show-results succeeds"),
            LaunchtestExitCode::TEST_RUN_FAILED
        );
        assert_eq!(
            writer.stdout(),
            format!(
                "        FAIL {}/listener/launchtest.json (native): \
                 3 tests, 0 errors, 1 failures, 1 skipped\n\
                 Summary: 4 tests, 0 errors, 1 failures, 1 skipped\n",
                dir.path()
            )
        );
    }

    #[test]
    fn show_results_all_verbose() {
        let dir = populated_results_dir();
        std::fs::write(dir.path().join("broken.json"), "{").expect("file written");
        let (result, writer) = exec(
            &[
                "launchtest",
                "show-results",
                "--results-dir",
                dir.path().as_str(),
                "--all",
            ],
            true,
        );
        assert_eq!(
            result.expect("show-results succeeds"),
            LaunchtestExitCode::TEST_RUN_FAILED
        );
        assert_eq!(
            writer.stdout(),
            formatdoc! {"
                            FAIL {dir}/listener/launchtest.json (native): 3 tests, 0 errors, 1 failures, 1 skipped
                                FAIL chatter_rate
                                     assertion: expected at least 101 messages, received 50
                                SKIP filtered_out
                                     filtered: excluded by filter
                            PASS {dir}/talker/launchtest.json (native): 1 tests, 0 errors, 0 failures, 0 skipped
                      UNREADABLE {dir}/broken.json
                    Summary: 4 tests, 0 errors, 1 failures, 1 skipped (1 unreadable result files)
                ",
                dir = dir.path()
            }
        );
    }

    #[test]
    fn show_results_missing_dir_is_empty_success() {
        let dir = Utf8TempDir::with_prefix("launchtest-show-").expect("temp dir created");
        let missing = dir.path().join("missing");
        let (result, writer) = exec(
            &["launchtest", "show-results", "--results-dir", missing.as_str()],
            false,
        );
        assert_eq!(result.expect("show-results succeeds"), LaunchtestExitCode::OK);
        assert_eq!(
            writer.stdout(),
            "Summary: 0 tests, 0 errors, 0 failures, 0 skipped\n"
        );
    }

    fn write_suite_file(dir: &Utf8Path, file_name: &str, contents: &str) -> String {
        let path = dir.join(file_name);
        std::fs::write(&path, contents).expect("suite file written");
        path.into_string()
    }

    #[test]
    fn list_tests_groups_by_phase() {
        let dir = Utf8TempDir::with_prefix("launchtest-list-").expect("temp dir created");
        let suite_file = write_suite_file(
            dir.path(),
            "launchtest.toml",
            indoc! {r#"
                [suite]
                name = "talker-listener"

                [[worker]]
                name = "talker"
                command = ["talker"]

                [[test]]
                name = "talker_logs"
                kind = "wait-for-output"
                worker = "talker"
                pattern = "Publishing"

                [[test]]
                name = "talker_ready"
                kind = "wait-for-output"
                worker = "talker"
                pattern = "ready"

                [[post-shutdown]]
                name = "exit_codes"
                kind = "exit-codes"
            "#},
        );

        let (result, writer) = exec(&["launchtest", "list-tests", "--suite", &suite_file], false);
        assert_eq!(result.expect("list-tests succeeds"), LaunchtestExitCode::OK);
        assert_eq!(
            writer.stdout(),
            indoc! {"
                talker-listener:
                    active:
                        talker_logs
                        talker_ready
                    post-shutdown:
                        exit_codes
            "}
        );

        let (result, writer) = exec(
            &["launchtest", "list-tests", "--suite", &suite_file, "--filter", "logs"],
            false,
        );
        assert_eq!(result.expect("list-tests succeeds"), LaunchtestExitCode::OK);
        assert_eq!(
            writer.stdout(),
            indoc! {"
                talker-listener:
                    active:
                        talker_logs
            "}
        );
    }

    #[test]
    fn invalid_suite_file_is_a_setup_error() {
        let dir = Utf8TempDir::with_prefix("launchtest-list-").expect("temp dir created");
        let suite_file = write_suite_file(
            dir.path(),
            "launchtest.toml",
            indoc! {r#"
                [suite]
                name = "talker"
                ready-delay = "soon"
            "#},
        );
        let (result, _) = exec(&["launchtest", "list-tests", "--suite", &suite_file], false);
        let error = result.expect_err("suite file is invalid");
        assert!(
            matches!(error, ExpectedError::ConfigParseError { .. }),
            "unexpected error: {error:?}"
        );
        assert_eq!(error.process_exit_code(), LaunchtestExitCode::SETUP_ERROR);
    }

    fn empty_suite(dir: &Utf8Path, name: &str, port_base: u16) -> String {
        write_suite_file(
            dir,
            &format!("{name}.toml"),
            &formatdoc! {r#"
                [suite]
                name = "{name}"
                ready-delay = "10ms"

                [isolation]
                env-var = "LAUNCHTEST_CLI_TEST_ISOLATION_ID"
                lock-port-base = {port_base}
            "#},
        )
    }

    #[test]
    fn run_tests_with_no_tests() {
        let dir = Utf8TempDir::with_prefix("launchtest-run-").expect("temp dir created");
        let suite_file = empty_suite(dir.path(), "empty", 46000);
        let results_dir = dir.path().join("results");

        let (result, writer) = exec(
            &[
                "launchtest",
                "run-tests",
                "--suite",
                &suite_file,
                "--results-dir",
                results_dir.as_str(),
            ],
            false,
        );
        let error = result.expect_err("no tests ran");
        assert!(matches!(error, ExpectedError::NoTestsRun), "unexpected error: {error:?}");
        assert!(
            writer.stderr().contains("Starting 0 tests in empty"),
            "stderr: {}",
            writer.stderr()
        );
        assert!(results_dir.join("empty/launchtest.json").is_file());
        assert!(results_dir.join("empty/launchtest.xunit.xml").is_file());

        let (result, _) = exec(
            &[
                "launchtest",
                "run-tests",
                "--suite",
                &suite_file,
                "--results-dir",
                results_dir.as_str(),
                "--no-tests",
                "pass",
            ],
            false,
        );
        assert_eq!(result.expect("no tests is a pass"), LaunchtestExitCode::OK);
    }
}
