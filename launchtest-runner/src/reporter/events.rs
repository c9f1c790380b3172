// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events for the reporter.
//!
//! These types form the interface between the suite runner and the reporter: the runner sends
//! [`RunEvent`]s on an unbounded channel, and the [`Displayer`](super::Displayer) renders them.

use crate::{
    cancel::CancelReason,
    isolation::IsolationId,
    launcher::{WorkerExit, WorkerExitStatus},
    output::OutputStream,
};
use chrono::{DateTime, FixedOffset, Local};
use launchtest_metadata::{RunReportSummary, TestCaseSummary, TestPhase};
use quick_junit::ReportUuid;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedSender;

/// A run event.
#[derive(Clone, Debug)]
pub struct RunEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The suite the event belongs to.
    pub suite: Arc<str>,

    /// The kind of run event this is.
    pub kind: RunEventKind,
}

/// The kind of run event this is.
///
/// Forms part of [`RunEvent`].
#[derive(Clone, Debug)]
pub enum RunEventKind {
    /// The run started.
    RunStarted {
        /// The unique id of the run.
        run_id: ReportUuid,

        /// The isolation id of the run, or `None` if no id could be obtained.
        isolation_id: Option<IsolationId>,

        /// The number of tests selected by the filter, across both phases.
        selected: usize,

        /// The number of tests excluded by the filter.
        filtered: usize,
    },

    /// A worker was spawned.
    WorkerStarted {
        /// The worker.
        worker: String,

        /// The process id, if known.
        pid: Option<u32>,
    },

    /// A worker produced a line of output. Only sent when output streaming is enabled.
    WorkerOutput {
        /// The worker.
        worker: String,

        /// The stream.
        stream: OutputStream,

        /// The line.
        line: String,
    },

    /// The readiness delay elapsed and active tests are about to run.
    WorkersReady {
        /// The number of workers.
        worker_count: usize,

        /// The readiness delay.
        ready_delay: Duration,
    },

    /// Workers failed to start.
    LaunchFailed {
        /// The error message, including its causes.
        message: String,
    },

    /// A worker exited on its own while active tests were running.
    WorkerExited {
        /// The worker.
        worker: String,

        /// The exit status.
        status: WorkerExitStatus,
    },

    /// A test started.
    TestStarted {
        /// The test.
        name: String,

        /// The phase.
        phase: TestPhase,
    },

    /// A test finished, or was skipped.
    TestFinished {
        /// The test case result.
        test_case: TestCaseSummary,
    },

    /// All workers were terminated.
    WorkersTerminated {
        /// The exits, in worker order.
        exits: Vec<WorkerExit>,
    },

    /// The run was cancelled.
    RunCancelled {
        /// The reason.
        reason: CancelReason,
    },

    /// The run finished and its report was built.
    RunFinished {
        /// The report.
        report: Arc<RunReportSummary>,
    },
}

/// Sends events for a single suite.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    sender: UnboundedSender<RunEvent>,
    suite: Arc<str>,
}

impl EventSink {
    pub(crate) fn new(sender: UnboundedSender<RunEvent>, suite: &str) -> Self {
        Self {
            sender,
            suite: suite.into(),
        }
    }

    pub(crate) fn send(&self, kind: RunEventKind) {
        // The receiver going away (e.g. the reporter panicked) must not stop the run.
        _ = self.sender.send(RunEvent {
            timestamp: Local::now().fixed_offset(),
            suite: self.suite.clone(),
            kind,
        });
    }
}
