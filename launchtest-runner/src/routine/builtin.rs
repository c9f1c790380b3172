// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Fixture, RoutineError, RoutineFuture, ShutdownFixture, ShutdownRoutine, TestRoutine};
use crate::{launcher::WorkerExitStatus, output::StreamSelector};
use regex::Regex;
use std::{num::NonZeroUsize, time::Duration};
use swrite::{SWrite, swrite};

/// Waits for a line of a worker's output to match a pattern.
#[derive(Clone, Debug)]
pub struct WaitForOutput {
    /// The worker.
    pub worker: String,
    /// The pattern to look for.
    pub pattern: Regex,
    /// The streams to look at.
    pub stream: StreamSelector,
    /// How long to wait.
    pub timeout: Duration,
}

impl TestRoutine for WaitForOutput {
    fn run<'a>(&'a self, fixture: &'a mut Fixture) -> RoutineFuture<'a> {
        Box::pin(async move {
            fixture
                .wait_for_output(&self.worker, &self.pattern, self.stream, self.timeout)
                .await?;
            Ok(())
        })
    }
}

/// Observes a topic for a window and checks the messages received.
#[derive(Clone, Debug)]
pub struct MessageCount {
    /// The topic.
    pub topic: String,
    /// The observation window.
    pub window: Duration,
    /// The subscription capacity.
    pub capacity: NonZeroUsize,
    /// The minimum number of messages expected.
    pub min_count: Option<usize>,
    /// The maximum number of messages expected.
    pub max_count: Option<usize>,
    /// A substring that at least one message must contain.
    pub contains: Option<String>,
}

impl TestRoutine for MessageCount {
    fn run<'a>(&'a self, fixture: &'a mut Fixture) -> RoutineFuture<'a> {
        Box::pin(async move {
            let mut subscription = fixture.subscribe(&self.topic, self.capacity)?;
            let messages = subscription.collect_for(self.window).await;
            let received = messages.len();

            let mut problems = Vec::new();
            if let Some(min) = self.min_count.filter(|&min| received < min) {
                problems.push(format!("expected at least {min} messages, received {received}"));
            }
            if let Some(max) = self.max_count.filter(|&max| received > max) {
                problems.push(format!("expected at most {max} messages, received {received}"));
            }
            if let Some(needle) = &self.contains {
                if !messages.iter().any(|message| message.contains(needle.as_str())) {
                    problems.push(format!("no message contained `{needle}`"));
                }
            }
            if problems.is_empty() {
                return Ok(());
            }

            let mut message = format!(
                "on `{}` over {}: {}",
                self.topic,
                humantime::format_duration(self.window),
                problems.join("; "),
            );
            if subscription.dropped() > 0 {
                swrite!(
                    message,
                    " ({} dropped at capacity {})",
                    subscription.dropped(),
                    self.capacity
                );
            }
            if subscription.is_closed() {
                message.push_str(" (subscription closed early)");
            }
            Err(RoutineError::assertion(message))
        })
    }
}

/// Checks that workers exited with allowed codes.
#[derive(Clone, Debug, Default)]
pub struct ExitCodes {
    /// The workers to check, or every worker if `None`.
    pub workers: Option<Vec<String>>,
    /// The allowed codes, or each worker's expected exit codes if `None`.
    pub allowed: Option<Vec<i32>>,
}

impl ShutdownRoutine for ExitCodes {
    fn run<'a>(&'a self, fixture: &'a ShutdownFixture) -> RoutineFuture<'a> {
        Box::pin(async move {
            let exits = match &self.workers {
                Some(names) => names
                    .iter()
                    .map(|name| fixture.exit(name))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(RoutineError::unexpected)?,
                None => fixture.exits().iter().collect(),
            };

            let offending: Vec<_> = exits
                .into_iter()
                .filter_map(|exit| {
                    let allowed = self.allowed.as_deref().unwrap_or(&exit.expected_exit_codes);
                    if exit.is_allowed(allowed) {
                        return None;
                    }
                    let status = match exit.status {
                        WorkerExitStatus::Code(code) => format!("code {code}"),
                        WorkerExitStatus::Signal(signal) => {
                            format!("code {} ({})", -signal, exit.status)
                        }
                        WorkerExitStatus::Unknown => "an unknown status".to_owned(),
                    };
                    Some(format!(
                        "worker `{}` exited with {status} (allowed: {allowed:?})",
                        exit.name
                    ))
                })
                .collect();

            if offending.is_empty() {
                Ok(())
            } else {
                Err(RoutineError::assertion(offending.join("; ")))
            }
        })
    }
}

/// Checks that a worker's final output contains a line matching a pattern.
#[derive(Clone, Debug)]
pub struct OutputContains {
    /// The worker.
    pub worker: String,
    /// The pattern to look for.
    pub pattern: Regex,
    /// The streams to look at.
    pub stream: StreamSelector,
}

impl ShutdownRoutine for OutputContains {
    fn run<'a>(&'a self, fixture: &'a ShutdownFixture) -> RoutineFuture<'a> {
        Box::pin(async move {
            let output = fixture
                .output(&self.worker)
                .map_err(RoutineError::unexpected)?;
            if output.contains(&self.pattern, self.stream) {
                Ok(())
            } else {
                Err(RoutineError::assertion(format!(
                    "pattern `{}` not found in {} of `{}`",
                    self.pattern, self.stream, self.worker
                )))
            }
        })
    }
}
