// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    cancel::{CancelReason, CancelToken},
    errors::{DisplayErrorChain, LaunchError, TestRunnerBuildError},
    isolation::{IsolationAllocator, IsolationId, IsolationLease},
    launcher::{Launcher, ReadyOutcome, RunningWorkers, TerminatedWorkers},
    reporter::events::{EventSink, RunEvent, RunEventKind},
    routine::{Fixture, RoutineError, ShutdownFixture},
    signal::{SignalHandler, SignalHandlerKind},
    suite::Suite,
    test_filter::TestFilter,
    time::stopwatch,
};
use futures::{StreamExt, future::BoxFuture};
use launchtest_metadata::{
    DetailKind, FailureDetail, RunReportSummary, TestCaseSummary, TestOutcome, TestPhase,
};
use quick_junit::ReportUuid;
use std::{
    any::Any, collections::HashMap, num::NonZeroUsize, pin::pin, sync::Arc, time::Duration,
};
use tokio::{runtime::Runtime, sync::mpsc::unbounded_channel, task::JoinError};
use tracing::debug;

/// Where each run gets its isolation id from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IsolationSource {
    /// Lease a distinct id for every run.
    #[default]
    Lease,

    /// Use the id already set in the launching environment, verbatim.
    Inherit,
}

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    filter: TestFilter,
    stream_output: bool,
    jobs: Option<NonZeroUsize>,
    isolation_source: IsolationSource,
}

impl TestRunnerBuilder {
    /// Creates a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter that selects tests by name.
    pub fn set_filter(&mut self, filter: TestFilter) -> &mut Self {
        self.filter = filter;
        self
    }

    /// Forwards worker output as events while workers run.
    pub fn set_stream_output(&mut self, stream_output: bool) -> &mut Self {
        self.stream_output = stream_output;
        self
    }

    /// Sets the number of suites to run concurrently. Defaults to 1.
    pub fn set_jobs(&mut self, jobs: NonZeroUsize) -> &mut Self {
        self.jobs = Some(jobs);
        self
    }

    /// Sets where isolation ids come from.
    pub fn set_isolation_source(&mut self, source: IsolationSource) -> &mut Self {
        self.isolation_source = source;
        self
    }

    /// Creates a new test runner for the given suites.
    pub fn build(
        self,
        suites: Vec<Suite>,
        signal_handler: SignalHandlerKind,
    ) -> Result<TestRunner, TestRunnerBuildError> {
        check_lock_ports(&suites)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("launchtest-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                suites,
                filter: self.filter,
                stream_output: self.stream_output,
                jobs: self.jobs.map_or(1, NonZeroUsize::get),
                isolation_source: self.isolation_source,
            },
            signal_handler,
            runtime,
        })
    }
}

// Runs sharing an isolation variable must lock ids through the same ports.
fn check_lock_ports(suites: &[Suite]) -> Result<(), TestRunnerBuildError> {
    let mut seen: HashMap<&str, &Suite> = HashMap::new();
    for suite in suites {
        let isolation = suite.isolation();
        let first = *seen.entry(isolation.env_var()).or_insert(suite);
        let first_base = first.isolation().lock_port_base();
        if first_base != isolation.lock_port_base() {
            return Err(TestRunnerBuildError::ConflictingLockPorts {
                env_var: isolation.env_var().to_owned(),
                first: first.name().to_owned(),
                first_base,
                second: suite.name().to_owned(),
                second_base: isolation.lock_port_base(),
            });
        }
    }
    Ok(())
}

/// The result of running one suite.
#[derive(Debug)]
pub struct SuiteRunOutcome {
    /// The report for the run. Always produced, even if the launch failed.
    pub report: Arc<RunReportSummary>,

    /// The error that prevented the workers from starting, if any.
    pub launch_error: Option<LaunchError>,
}

impl SuiteRunOutcome {
    /// Returns true if the run launched, wasn't cancelled, and no selected test failed.
    pub fn is_success(&self) -> bool {
        self.launch_error.is_none() && self.report.is_success()
    }
}

/// Context for running suites.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    inner: TestRunnerInner,
    signal_handler: SignalHandler,
    runtime: Runtime,
}

impl TestRunner {
    /// Runs every suite, calling `callback` with each event as it happens.
    ///
    /// Returns one outcome per suite, in suite order.
    pub fn execute<F>(self, mut callback: F) -> Vec<SuiteRunOutcome>
    where
        F: FnMut(RunEvent) + Send,
    {
        let Self {
            inner,
            mut signal_handler,
            runtime,
        } = self;

        let outcomes = runtime.block_on(async {
            let (sender, mut receiver) = unbounded_channel();
            let cancel = CancelToken::new();

            let mut run = pin!(inner.run_all(sender, &cancel));
            let outcomes = loop {
                tokio::select! {
                    outcomes = &mut run => break outcomes,
                    Some(event) = receiver.recv() => callback(event),
                    event = signal_handler.recv() => {
                        debug!(%event, "received shutdown signal, cancelling runs");
                        cancel.cancel(CancelReason::Signal(event));
                    }
                }
            };
            while let Ok(event) = receiver.try_recv() {
                callback(event);
            }
            outcomes
        });

        // Echo commands and pumps may still be winding down; don't wait for them.
        runtime.shutdown_background();
        outcomes
    }
}

#[derive(Debug)]
struct TestRunnerInner {
    suites: Vec<Suite>,
    filter: TestFilter,
    stream_output: bool,
    jobs: usize,
    isolation_source: IsolationSource,
}

impl TestRunnerInner {
    async fn run_all(
        &self,
        sender: tokio::sync::mpsc::UnboundedSender<RunEvent>,
        cancel: &CancelToken,
    ) -> Vec<SuiteRunOutcome> {
        futures::stream::iter(&self.suites)
            .map(move |suite| {
                let run = SuiteRun {
                    suite,
                    filter: &self.filter,
                    stream_output: self.stream_output,
                    sink: EventSink::new(sender.clone(), suite.name()),
                };
                run.execute(self.isolation_source, cancel)
            })
            .buffered(self.jobs)
            .collect()
            .await
    }
}

/// A single isolated run of a suite.
struct SuiteRun<'a> {
    suite: &'a Suite,
    filter: &'a TestFilter,
    stream_output: bool,
    sink: EventSink,
}

impl SuiteRun<'_> {
    async fn execute(self, source: IsolationSource, parent: &CancelToken) -> SuiteRunOutcome {
        let stopwatch = stopwatch();
        let run_id = ReportUuid::new_v4();
        let mut recorder = CaseRecorder::new(self.sink.clone());

        let (selected, filtered) = self
            .suite
            .test_names()
            .fold((0, 0), |(selected, filtered), (name, _)| {
                if self.filter.matches(name) {
                    (selected + 1, filtered)
                } else {
                    (selected, filtered + 1)
                }
            });

        let allocator = IsolationAllocator::new(self.suite.isolation().clone());
        let lease = match source {
            IsolationSource::Lease => allocator.lease(),
            IsolationSource::Inherit => {
                let value = std::env::var(self.suite.isolation().env_var()).ok();
                allocator.inherit(value.as_deref())
            }
        };

        let isolation_id = lease.as_ref().ok().map(IsolationLease::id);
        self.sink.send(RunEventKind::RunStarted {
            run_id,
            isolation_id,
            selected,
            filtered,
        });

        // Runs as a local token so that a global timeout only cancels this suite.
        let cancel = CancelToken::new();
        let watcher = tokio::spawn(watch_cancel(
            parent.clone(),
            cancel.clone(),
            self.suite.settings().global_timeout,
            self.sink.clone(),
        ));

        let launch_error = match lease {
            Ok(lease) => {
                let result = self.run_isolated(&lease, &cancel, &mut recorder).await;
                drop(lease);
                result.err()
            }
            Err(error) => Some(LaunchError::Isolation(error)),
        };
        if let Some(error) = &launch_error {
            self.record_launch_failure(error, &mut recorder);
        }
        watcher.abort();

        let snapshot = stopwatch.snapshot();
        let mut report = RunReportSummary::new(
            self.suite.name(),
            run_id.to_string(),
            snapshot.start_time_fixed(),
            snapshot.duration,
            recorder.finish(),
        );
        report.isolation_id = isolation_id.map(IsolationId::get);
        report.launch_error = launch_error
            .as_ref()
            .map(|error| DisplayErrorChain::new(error).to_string());
        report.cancel_reason = cancel.reason().map(|reason| reason.to_string());

        let report = Arc::new(report);
        self.sink.send(RunEventKind::RunFinished {
            report: report.clone(),
        });
        SuiteRunOutcome {
            report,
            launch_error,
        }
    }

    async fn run_isolated(
        &self,
        lease: &IsolationLease,
        cancel: &CancelToken,
        recorder: &mut CaseRecorder,
    ) -> Result<(), LaunchError> {
        let launcher = Launcher::new(lease.env().clone())
            .with_events(self.sink.clone(), self.stream_output);
        let started = launcher.start(self.suite.workers())?;
        let worker_count = started.len();

        let ready_delay = self.suite.settings().ready_delay;
        let terminated = match started.wait_ready(ready_delay, cancel).await {
            ReadyOutcome::Ready(mut running) => {
                self.sink.send(RunEventKind::WorkersReady {
                    worker_count,
                    ready_delay,
                });
                self.run_active_phase(lease, &mut running, cancel, recorder)
                    .await;
                if cancel.is_cancelled() {
                    running.kill().await
                } else {
                    running.terminate(self.suite.shutdown(), cancel).await
                }
            }
            ReadyOutcome::Cancelled { workers, reason } => {
                debug!(suite = %self.suite.name(), %reason, "cancelled before workers were ready");
                for test in self.suite.active_tests() {
                    self.record_not_run(test.name(), TestPhase::Active, recorder, &reason);
                }
                workers.kill().await
            }
        };

        self.sink.send(RunEventKind::WorkersTerminated {
            exits: terminated.exits().to_vec(),
        });
        self.run_post_shutdown_phase(terminated, cancel, recorder)
            .await;
        Ok(())
    }

    async fn run_active_phase(
        &self,
        lease: &IsolationLease,
        running: &mut RunningWorkers,
        cancel: &CancelToken,
        recorder: &mut CaseRecorder,
    ) {
        let outputs = running.outputs();
        for test in self.suite.active_tests() {
            if !self.filter.matches(test.name()) {
                recorder.skip(test.name(), TestPhase::Active, filtered_detail());
                continue;
            }
            if let Some(reason) = cancel.reason() {
                self.record_not_run(test.name(), TestPhase::Active, recorder, &reason);
                continue;
            }

            self.sink.send(RunEventKind::TestStarted {
                name: test.name().to_owned(),
                phase: TestPhase::Active,
            });
            let routine = test.routine().clone();
            let mut fixture = Fixture::new(
                lease.env().clone(),
                outputs.clone(),
                self.suite.transport().clone(),
            );
            let future: BoxFuture<'static, _> =
                Box::pin(async move { routine.run(&mut fixture).await });
            let test_case = run_test(
                test.name(),
                TestPhase::Active,
                future,
                self.suite.settings().test_timeout,
                cancel,
            )
            .await;
            recorder.record(test_case);

            for (worker, status) in running.reap_exited() {
                debug!(suite = %self.suite.name(), %worker, %status, "worker exited during active phase");
                self.sink.send(RunEventKind::WorkerExited { worker, status });
            }
        }
    }

    async fn run_post_shutdown_phase(
        &self,
        terminated: TerminatedWorkers,
        cancel: &CancelToken,
        recorder: &mut CaseRecorder,
    ) {
        let fixture = ShutdownFixture::new(terminated);
        for test in self.suite.post_shutdown_tests() {
            if !self.filter.matches(test.name()) {
                recorder.skip(test.name(), TestPhase::PostShutdown, filtered_detail());
                continue;
            }
            if let Some(reason) = cancel.reason() {
                self.record_not_run(test.name(), TestPhase::PostShutdown, recorder, &reason);
                continue;
            }

            self.sink.send(RunEventKind::TestStarted {
                name: test.name().to_owned(),
                phase: TestPhase::PostShutdown,
            });
            let routine = test.routine().clone();
            let fixture = fixture.clone();
            let future: BoxFuture<'static, _> =
                Box::pin(async move { routine.run(&fixture).await });
            let test_case = run_test(
                test.name(),
                TestPhase::PostShutdown,
                future,
                self.suite.settings().test_timeout,
                cancel,
            )
            .await;
            recorder.record(test_case);
        }
    }

    fn record_launch_failure(&self, error: &LaunchError, recorder: &mut CaseRecorder) {
        debug!(suite = %self.suite.name(), %error, "launch failed");
        self.sink.send(RunEventKind::LaunchFailed {
            message: DisplayErrorChain::new(error).to_string(),
        });
        let message = format!("workers failed to start: {error}");
        for (name, phase) in self.suite.test_names() {
            if !self.filter.matches(name) {
                recorder.skip(name, phase, filtered_detail());
                continue;
            }
            recorder.record(TestCaseSummary {
                name: name.to_owned(),
                phase,
                outcome: TestOutcome::Error,
                duration: Duration::ZERO,
                detail: Some(FailureDetail::new(DetailKind::Launch, message.clone())),
            });
        }
    }

    fn record_not_run(
        &self,
        name: &str,
        phase: TestPhase,
        recorder: &mut CaseRecorder,
        reason: &CancelReason,
    ) {
        if !self.filter.matches(name) {
            recorder.skip(name, phase, filtered_detail());
        } else {
            recorder.skip(
                name,
                phase,
                FailureDetail::new(DetailKind::NotRun, format!("run cancelled: {reason}")),
            );
        }
    }
}

fn filtered_detail() -> FailureDetail {
    FailureDetail::new(DetailKind::Filtered, "excluded by filter")
}

/// Forwards cancellation from `parent` to `child`, and cancels `child` once the global timeout
/// elapses.
async fn watch_cancel(
    parent: CancelToken,
    child: CancelToken,
    global_timeout: Option<Duration>,
    sink: EventSink,
) {
    let timeout = async {
        match global_timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                CancelReason::GlobalTimeout(timeout)
            }
            None => std::future::pending().await,
        }
    };
    let reason = tokio::select! {
        reason = parent.cancelled() => reason,
        reason = timeout => reason,
    };
    if child.cancel(reason) {
        sink.send(RunEventKind::RunCancelled { reason });
    }
}

/// How a routine's task ended.
#[derive(Debug)]
enum TaskStatus {
    Finished(Result<(), RoutineError>),
    Panicked(String),
    Aborted(JoinError),
    TimedOut(Duration),
    Cancelled(CancelReason),
}

/// Runs a routine in its own task under the test timeout, and classifies how it ended.
async fn run_test(
    name: &str,
    phase: TestPhase,
    future: BoxFuture<'static, Result<(), RoutineError>>,
    timeout: Duration,
    cancel: &CancelToken,
) -> TestCaseSummary {
    let stopwatch = stopwatch();
    let mut handle = tokio::spawn(future);

    let status = tokio::select! {
        biased;
        reason = cancel.cancelled() => {
            handle.abort();
            TaskStatus::Cancelled(reason)
        }
        result = tokio::time::timeout(timeout, &mut handle) => match result {
            Ok(Ok(result)) => TaskStatus::Finished(result),
            Ok(Err(error)) if error.is_panic() => {
                TaskStatus::Panicked(panic_message(error.into_panic()))
            }
            Ok(Err(error)) => TaskStatus::Aborted(error),
            Err(_) => {
                handle.abort();
                TaskStatus::TimedOut(timeout)
            }
        },
    };

    let (outcome, detail) = match status {
        TaskStatus::Finished(Ok(())) => (TestOutcome::Pass, None),
        TaskStatus::Finished(Err(RoutineError::Assertion { message })) => (
            TestOutcome::Fail,
            Some(FailureDetail::new(DetailKind::Assertion, message)),
        ),
        TaskStatus::Finished(Err(RoutineError::Unexpected(error))) => {
            let message = error.to_string();
            let chain = DisplayErrorChain::new(error.as_ref()).to_string();
            let detail = FailureDetail::new(DetailKind::Unexpected, message.clone());
            let detail = if chain == message {
                detail
            } else {
                detail.with_description(chain)
            };
            (TestOutcome::Error, Some(detail))
        }
        TaskStatus::Panicked(message) => (
            TestOutcome::Error,
            Some(FailureDetail::new(
                DetailKind::Panic,
                format!("test panicked: {message}"),
            )),
        ),
        TaskStatus::Aborted(error) => (
            TestOutcome::Error,
            Some(FailureDetail::new(DetailKind::Unexpected, error.to_string())),
        ),
        TaskStatus::TimedOut(timeout) => (
            TestOutcome::Fail,
            Some(FailureDetail::new(
                DetailKind::Timeout,
                format!(
                    "test timed out after {}",
                    humantime::format_duration(timeout)
                ),
            )),
        ),
        TaskStatus::Cancelled(reason) => (
            TestOutcome::Error,
            Some(FailureDetail::new(
                DetailKind::Cancelled,
                format!("test cancelled: {reason}"),
            )),
        ),
    };

    TestCaseSummary {
        name: name.to_owned(),
        phase,
        outcome,
        duration: stopwatch.elapsed(),
        detail,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}

/// Collects test cases in execution order and reports each one as it is recorded.
struct CaseRecorder {
    sink: EventSink,
    test_cases: Vec<TestCaseSummary>,
}

impl CaseRecorder {
    fn new(sink: EventSink) -> Self {
        Self {
            sink,
            test_cases: Vec::new(),
        }
    }

    fn record(&mut self, test_case: TestCaseSummary) {
        self.sink.send(RunEventKind::TestFinished {
            test_case: test_case.clone(),
        });
        self.test_cases.push(test_case);
    }

    fn skip(&mut self, name: &str, phase: TestPhase, detail: FailureDetail) {
        self.record(TestCaseSummary {
            name: name.to_owned(),
            phase,
            outcome: TestOutcome::Skip,
            duration: Duration::ZERO,
            detail: Some(detail),
        });
    }

    fn finish(self) -> Vec<TestCaseSummary> {
        self.test_cases
    }
}
