// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::events::{RunEvent, RunEventKind};
use crate::{
    helpers::{DisplayBracketedDuration, plural},
    output::OutputStream,
};
use launchtest_metadata::{DetailKind, RunReportSummary, TestCaseSummary, TestOutcome};
use owo_colors::{OwoColorize, Style};
use std::io::{self, Write};

/// Renders run events for a terminal.
#[derive(Debug, Default)]
pub struct Displayer {
    styles: Styles,
    show_filtered: bool,
}

impl Displayer {
    /// Creates a new displayer without colors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Also prints a `SKIP` line for each test excluded by the filter.
    pub fn set_show_filtered(&mut self, show_filtered: bool) {
        self.show_filtered = show_filtered;
    }

    /// Writes an event to `writer`.
    pub fn write_event(&self, event: &RunEvent, writer: &mut dyn Write) -> io::Result<()> {
        let suite = &*event.suite;
        match &event.kind {
            RunEventKind::RunStarted {
                run_id,
                isolation_id,
                selected,
                filtered,
            } => {
                write!(writer, "{:>12} ", "Starting".style(self.styles.pass))?;
                write!(
                    writer,
                    "{} {} in {}",
                    selected.style(self.styles.count),
                    plural::tests_str(*selected),
                    suite.style(self.styles.suite),
                )?;
                if *filtered > 0 {
                    write!(
                        writer,
                        " ({} {} filtered out)",
                        filtered.style(self.styles.count),
                        plural::tests_str(*filtered),
                    )?;
                }
                write!(writer, " [run ID {run_id}")?;
                if let Some(id) = isolation_id {
                    write!(writer, ", isolation ID {}", id.style(self.styles.count))?;
                }
                writeln!(writer, "]")?;
            }
            RunEventKind::WorkerStarted { .. } => {}
            RunEventKind::WorkerOutput {
                worker,
                stream,
                line,
            } => {
                let style = match stream {
                    OutputStream::Stdout => self.styles.worker,
                    OutputStream::Stderr => self.styles.worker_stderr,
                };
                writeln!(writer, "{} {line}", format!("[{worker}]").style(style))?;
            }
            RunEventKind::WorkersReady {
                worker_count,
                ready_delay,
            } => {
                write!(writer, "{:>12} ", "Ready".style(self.styles.pass))?;
                writeln!(
                    writer,
                    "{} {} in {} after {}",
                    worker_count.style(self.styles.count),
                    plural::workers_str(*worker_count),
                    suite.style(self.styles.suite),
                    humantime::format_duration(*ready_delay),
                )?;
            }
            RunEventKind::LaunchFailed { message } => {
                write!(writer, "{:>12} ", "LAUNCH FAIL".style(self.styles.fail))?;
                writeln!(writer, "{}: {message}", suite.style(self.styles.suite))?;
            }
            RunEventKind::WorkerExited { worker, status } => {
                write!(writer, "{:>12} ", "EXITED".style(self.styles.skip))?;
                writeln!(
                    writer,
                    "{} worker {} exited early with {status}",
                    suite.style(self.styles.suite),
                    worker.style(self.styles.count),
                )?;
            }
            RunEventKind::TestStarted { name, .. } => {
                write!(writer, "{:>12} ", "START".style(self.styles.pass))?;
                writeln!(writer, "{} {name}", suite.style(self.styles.suite))?;
            }
            RunEventKind::TestFinished { test_case } => {
                self.write_test_case(suite, test_case, writer)?;
            }
            RunEventKind::WorkersTerminated { exits } => {
                write!(writer, "{:>12} ", "Terminated".style(self.styles.pass))?;
                writeln!(
                    writer,
                    "{} {} in {}",
                    exits.len().style(self.styles.count),
                    plural::workers_str(exits.len()),
                    suite.style(self.styles.suite),
                )?;
                for exit in exits.iter().filter(|exit| !exit.is_expected()) {
                    writeln!(
                        writer,
                        "{:>12} worker {} exited with {} (expected {:?})",
                        "",
                        exit.name.style(self.styles.count),
                        exit.status.style(self.styles.skip),
                        exit.expected_exit_codes,
                    )?;
                }
            }
            RunEventKind::RunCancelled { reason } => {
                write!(writer, "{:>12} ", "Cancelling".style(self.styles.fail))?;
                writeln!(writer, "{}: {reason}", suite.style(self.styles.suite))?;
            }
            RunEventKind::RunFinished { report } => {
                self.write_summary(report, writer)?;
            }
        }
        Ok(())
    }

    fn write_test_case(
        &self,
        suite: &str,
        test_case: &TestCaseSummary,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let is_filtered = test_case
            .detail
            .as_ref()
            .is_some_and(|detail| detail.kind == DetailKind::Filtered);
        if is_filtered && !self.show_filtered {
            return Ok(());
        }

        let (label, style) = match test_case.outcome {
            TestOutcome::Pass => ("PASS", self.styles.pass),
            TestOutcome::Fail => ("FAIL", self.styles.fail),
            TestOutcome::Error => ("ERROR", self.styles.fail),
            TestOutcome::Skip => ("SKIP", self.styles.skip),
        };
        write!(writer, "{:>12} ", label.style(style))?;
        write!(writer, "{}", DisplayBracketedDuration(test_case.duration))?;
        writeln!(
            writer,
            "{} {}",
            suite.style(self.styles.suite),
            test_case.name
        )?;

        if let Some(detail) = &test_case.detail {
            if test_case.outcome.is_failure() || detail.kind == DetailKind::NotRun {
                writeln!(
                    writer,
                    "{:>12} {}: {}",
                    "",
                    detail.kind.style(style),
                    detail.message
                )?;
                if let Some(description) = &detail.description {
                    for line in description.lines() {
                        writeln!(writer, "{:>12} {line}", "")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_summary(&self, report: &RunReportSummary, writer: &mut dyn Write) -> io::Result<()> {
        writeln!(writer, "{}", "-".repeat(12))?;
        let style = if report.is_success() {
            self.styles.pass
        } else {
            self.styles.fail
        };
        write!(writer, "{:>12} ", "Summary".style(style))?;
        write!(writer, "{}", DisplayBracketedDuration(report.duration))?;
        writeln!(
            writer,
            "{}: {} passed, {}",
            report.suite.style(self.styles.suite),
            report.counts.passed().style(self.styles.count),
            report.counts,
        )?;
        if let Some(reason) = &report.cancel_reason {
            writeln!(writer, "{:>12} run was cancelled: {reason}", "")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    suite: Style,
    worker: Style,
    worker_stderr: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.suite = Style::new().magenta().bold();
        self.worker = Style::new().blue();
        self.worker_stderr = Style::new().purple();
    }
}
