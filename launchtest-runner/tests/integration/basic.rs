// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use launchtest_metadata::{DetailKind, TestOutcome, TestPhase};
use launchtest_runner::{
    errors::LaunchError,
    launcher::WorkerSpec,
    output::StreamSelector,
    reporter::events::RunEventKind,
    routine::{
        ExitCodes, Fixture, MessageCount, OutputContains, RoutineError, RoutineFuture,
        TestRoutine, WaitForOutput,
    },
    suite::SuiteSettings,
    test_filter::TestFilter,
    transport::ChannelTransport,
};
use pretty_assertions::assert_eq;
use regex::Regex;
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

/// Publishes messages on a topic under the run's isolation id while a [`MessageCount`] observes
/// it.
#[derive(Debug)]
struct PublishAndCount {
    transport: Arc<ChannelTransport>,
    published: usize,
    count: MessageCount,
}

impl TestRoutine for PublishAndCount {
    fn run<'a>(&'a self, fixture: &'a mut Fixture) -> RoutineFuture<'a> {
        Box::pin(async move {
            let id = fixture.isolation().id();
            let transport = self.transport.clone();
            let topic = self.count.topic.clone();
            let published = self.published;
            let publisher = tokio::spawn(async move {
                while transport.subscriber_count(id, &topic) == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                for i in 0..published {
                    transport.publish(id, &topic, format!("Hello World: {i}"));
                }
            });
            let result = self.count.run(fixture).await;
            publisher.await.map_err(RoutineError::unexpected)?;
            result
        })
    }
}

#[derive(Debug)]
struct Panics;

impl TestRoutine for Panics {
    fn run<'a>(&'a self, _fixture: &'a mut Fixture) -> RoutineFuture<'a> {
        Box::pin(async move { panic!("boom") })
    }
}

fn wait_for(worker: &str, pattern: &str, timeout: Duration) -> Result<WaitForOutput> {
    Ok(WaitForOutput {
        worker: worker.to_owned(),
        pattern: Regex::new(pattern)?,
        stream: StreamSelector::Any,
        timeout,
    })
}

#[test]
fn message_count_shortfall_fails() -> Result<()> {
    let transport = Arc::new(ChannelTransport::new());
    let mut builder = suite_builder("chatter", 43000);
    builder
        .transport(transport.clone())
        .worker(interruptible_worker("talker", 0))
        .active_test(
            "chatter_rate",
            PublishAndCount {
                transport,
                published: 50,
                count: MessageCount {
                    topic: "/chatter".to_owned(),
                    window: Duration::from_millis(500),
                    capacity: NonZeroUsize::new(1024).expect("non-zero"),
                    min_count: Some(101),
                    max_count: None,
                    contains: None,
                },
            },
        )
        .post_shutdown_test("exit_codes", ExitCodes::default());

    let (outcomes, _) = run_suites(vec![builder.build()?], |_| {})?;
    let outcome = &outcomes[0];

    let chatter_rate = test_case(outcome, "chatter_rate")?;
    assert_eq!(chatter_rate.outcome, TestOutcome::Fail);
    let detail = chatter_rate.detail.as_ref().expect("failure has detail");
    assert_eq!(detail.kind, DetailKind::Assertion);
    ensure!(
        detail.message.contains("expected at least 101 messages, received 50"),
        "unexpected message: {}",
        detail.message
    );

    assert_eq!(test_case(outcome, "exit_codes")?.outcome, TestOutcome::Pass);
    assert!(!outcome.is_success());
    assert_eq!(
        outcome.report.counts.to_string(),
        "2 tests, 0 errors, 1 failures, 0 skipped"
    );
    Ok(())
}

#[test]
fn exit_codes_pass_and_fail() -> Result<()> {
    let mut builder = suite_builder("exit-codes", 43100);
    builder
        .worker(interruptible_worker("cooperative", 0))
        .worker(interruptible_worker("stubborn", 3))
        .active_test(
            "cooperative_ready",
            wait_for("cooperative", "^ready$", Duration::from_secs(10))?,
        )
        .active_test(
            "stubborn_ready",
            wait_for("stubborn", "^ready$", Duration::from_secs(10))?,
        )
        .post_shutdown_test(
            "cooperative_exit",
            ExitCodes {
                workers: Some(vec!["cooperative".to_owned()]),
                allowed: None,
            },
        )
        .post_shutdown_test(
            "stubborn_exit",
            ExitCodes {
                workers: Some(vec!["stubborn".to_owned()]),
                allowed: Some(vec![0]),
            },
        )
        .post_shutdown_test(
            "stubborn_said_ready",
            OutputContains {
                worker: "stubborn".to_owned(),
                pattern: Regex::new("ready")?,
                stream: StreamSelector::Stdout,
            },
        );

    let (outcomes, events) = run_suites(vec![builder.build()?], |_| {})?;
    let outcome = &outcomes[0];
    assert!(outcome.launch_error.is_none());

    let outcomes_by_name: Vec<_> = outcome
        .report
        .test_cases
        .iter()
        .map(|test_case| (test_case.name.as_str(), test_case.phase, test_case.outcome))
        .collect();
    assert_eq!(
        outcomes_by_name,
        [
            ("cooperative_ready", TestPhase::Active, TestOutcome::Pass),
            ("stubborn_ready", TestPhase::Active, TestOutcome::Pass),
            ("cooperative_exit", TestPhase::PostShutdown, TestOutcome::Pass),
            ("stubborn_exit", TestPhase::PostShutdown, TestOutcome::Fail),
            ("stubborn_said_ready", TestPhase::PostShutdown, TestOutcome::Pass),
        ]
    );
    let detail = test_case(outcome, "stubborn_exit")?
        .detail
        .as_ref()
        .expect("failure has detail");
    assert_eq!(
        detail.message,
        "worker `stubborn` exited with code 3 (allowed: [0])"
    );

    // The run is bracketed by its start and finish events.
    assert!(matches!(
        events.first().map(|event| &event.kind),
        Some(RunEventKind::RunStarted { selected: 5, filtered: 0, isolation_id: Some(_), .. })
    ));
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(RunEventKind::RunFinished { .. })
    ));
    assert!(
        events
            .iter()
            .any(|event| matches!(event.kind, RunEventKind::WorkersTerminated { .. }))
    );
    Ok(())
}

#[test]
fn launch_error_marks_selected_tests_as_errors() -> Result<()> {
    let mut builder = suite_builder("broken", 43200);
    builder
        .worker(WorkerSpec::new("talker", "/nonexistent/launchtest-worker"))
        .active_test(
            "talker_logs",
            wait_for("talker", "Publishing", Duration::from_secs(1))?,
        )
        .post_shutdown_test("exit_codes", ExitCodes::default());

    let (outcomes, events) = run_suites(vec![builder.build()?], |builder| {
        builder.set_filter(TestFilter::new(["exit"]).expect("filter builds"));
    })?;
    let outcome = &outcomes[0];

    assert!(matches!(
        outcome.launch_error,
        Some(LaunchError::Spawn { ref worker, .. }) if worker == "talker"
    ));
    assert!(outcome.report.launch_error.is_some());

    let talker_logs = test_case(outcome, "talker_logs")?;
    assert_eq!(talker_logs.outcome, TestOutcome::Skip);
    assert_eq!(
        talker_logs.detail.as_ref().map(|detail| detail.kind),
        Some(DetailKind::Filtered)
    );
    let exit_codes = test_case(outcome, "exit_codes")?;
    assert_eq!(exit_codes.outcome, TestOutcome::Error);
    assert_eq!(
        exit_codes.detail.as_ref().map(|detail| detail.kind),
        Some(DetailKind::Launch)
    );

    assert!(
        events
            .iter()
            .any(|event| matches!(event.kind, RunEventKind::LaunchFailed { .. }))
    );
    Ok(())
}

#[test]
fn timeout_and_panic_do_not_stop_later_tests() -> Result<()> {
    let mut builder = suite_builder("timeouts", 43300);
    builder
        .settings(SuiteSettings {
            ready_delay: Duration::from_millis(100),
            test_timeout: Duration::from_millis(300),
            global_timeout: None,
        })
        .worker(interruptible_worker("talker", 0))
        .active_test(
            "never_matches",
            wait_for("talker", "never printed", Duration::from_secs(30))?,
        )
        .active_test("panics", Panics)
        .active_test(
            "talker_ready",
            wait_for("talker", "^ready$", Duration::from_millis(250))?,
        );

    let (outcomes, _) = run_suites(vec![builder.build()?], |_| {})?;
    let outcome = &outcomes[0];

    let never_matches = test_case(outcome, "never_matches")?;
    assert_eq!(never_matches.outcome, TestOutcome::Fail);
    let detail = never_matches.detail.as_ref().expect("failure has detail");
    assert_eq!(detail.kind, DetailKind::Timeout);
    assert_eq!(detail.message, "test timed out after 300ms");

    let panics = test_case(outcome, "panics")?;
    assert_eq!(panics.outcome, TestOutcome::Error);
    let detail = panics.detail.as_ref().expect("error has detail");
    assert_eq!(detail.kind, DetailKind::Panic);
    assert_eq!(detail.message, "test panicked: boom");

    assert_eq!(test_case(outcome, "talker_ready")?.outcome, TestOutcome::Pass);
    Ok(())
}

#[test]
fn global_timeout_cancels_the_run() -> Result<()> {
    let mut builder = suite_builder("cancelled", 43400);
    builder
        .settings(SuiteSettings {
            ready_delay: Duration::from_millis(100),
            test_timeout: Duration::from_secs(30),
            global_timeout: Some(Duration::from_secs(1)),
        })
        .worker(interruptible_worker("talker", 0))
        .active_test(
            "never_matches",
            wait_for("talker", "never printed", Duration::from_secs(30))?,
        )
        .active_test(
            "talker_ready",
            wait_for("talker", "^ready$", Duration::from_secs(1))?,
        )
        .post_shutdown_test("exit_codes", ExitCodes::default());

    let started = std::time::Instant::now();
    let (outcomes, events) = run_suites(vec![builder.build()?], |_| {})?;
    ensure!(
        started.elapsed() < Duration::from_secs(15),
        "cancellation took {:?}",
        started.elapsed()
    );
    let outcome = &outcomes[0];
    assert_eq!(
        outcome.report.cancel_reason.as_deref(),
        Some("global timeout of 1s elapsed")
    );
    assert!(!outcome.is_success());

    let kinds: Vec<_> = outcome
        .report
        .test_cases
        .iter()
        .map(|test_case| {
            (
                test_case.name.as_str(),
                test_case.outcome,
                test_case.detail.as_ref().map(|detail| detail.kind),
            )
        })
        .collect();
    assert_eq!(
        kinds,
        [
            ("never_matches", TestOutcome::Error, Some(DetailKind::Cancelled)),
            ("talker_ready", TestOutcome::Skip, Some(DetailKind::NotRun)),
            ("exit_codes", TestOutcome::Skip, Some(DetailKind::NotRun)),
        ]
    );
    assert!(
        events
            .iter()
            .any(|event| matches!(event.kind, RunEventKind::RunCancelled { .. }))
    );
    Ok(())
}
