// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test routines.
//!
//! A routine is the body of a test. Active routines ([`TestRoutine`]) run against live workers
//! through a [`Fixture`]; post-shutdown routines ([`ShutdownRoutine`]) inspect how the workers
//! exited through a [`ShutdownFixture`].
//!
//! A routine reports an assertion failure with [`RoutineError::Assertion`] and anything else that
//! went wrong with [`RoutineError::Unexpected`]. The runner records these as `fail` and `error`
//! respectively.

mod builtin;

pub use builtin::*;

use crate::{
    errors::SubscribeError,
    isolation::IsolationEnv,
    launcher::{TerminatedWorkers, WorkerExit},
    output::{OutputBuffer, OutputLine, StreamSelector, WaitError},
    transport::{Subscription, SubscriptionRelease, Transport},
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use regex::Regex;
use std::{
    error, fmt,
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;

/// The future returned by a routine.
pub type RoutineFuture<'a> = BoxFuture<'a, Result<(), RoutineError>>;

/// An active test routine, run while workers are live.
pub trait TestRoutine: fmt::Debug + Send + Sync {
    /// Runs the routine against a fresh fixture.
    fn run<'a>(&'a self, fixture: &'a mut Fixture) -> RoutineFuture<'a>;
}

/// A post-shutdown test routine, run after every worker has exited.
pub trait ShutdownRoutine: fmt::Debug + Send + Sync {
    /// Runs the routine against the final state of the workers.
    fn run<'a>(&'a self, fixture: &'a ShutdownFixture) -> RoutineFuture<'a>;
}

/// The ways a routine can fail.
#[derive(Debug, Error)]
pub enum RoutineError {
    /// An assertion about the system under test did not hold.
    #[error("{message}")]
    Assertion {
        /// A description of the failed assertion.
        message: String,
    },

    /// Something other than an assertion went wrong.
    #[error(transparent)]
    Unexpected(Box<dyn error::Error + Send + Sync>),
}

impl RoutineError {
    /// Creates an assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion {
            message: message.into(),
        }
    }

    /// Creates an unexpected error.
    pub fn unexpected(error: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Self::Unexpected(error.into())
    }
}

impl From<SubscribeError> for RoutineError {
    fn from(error: SubscribeError) -> Self {
        Self::unexpected(error)
    }
}

/// A routine referred to a worker that doesn't exist.
#[derive(Clone, Debug, Error)]
#[error("no worker named `{0}`")]
pub struct UnknownWorkerError(pub String);

/// The environment an active test runs in. Each test gets a fresh fixture.
#[derive(Debug)]
pub struct Fixture {
    isolation: IsolationEnv,
    outputs: IndexMap<String, Arc<OutputBuffer>>,
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<Vec<SubscriptionRelease>>,
}

impl Fixture {
    pub(crate) fn new(
        isolation: IsolationEnv,
        outputs: IndexMap<String, Arc<OutputBuffer>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            isolation,
            outputs,
            transport,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Returns the isolation env of the run.
    pub fn isolation(&self) -> &IsolationEnv {
        &self.isolation
    }

    /// Returns the names of all workers, in order.
    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Returns the live output of a worker.
    pub fn output(&self, worker: &str) -> Result<&Arc<OutputBuffer>, UnknownWorkerError> {
        self.outputs
            .get(worker)
            .ok_or_else(|| UnknownWorkerError(worker.to_owned()))
    }

    /// Subscribes to a topic under the run's isolation env.
    ///
    /// The subscription is released when it is dropped, and at the latest when the fixture is
    /// dropped at the end of the test, even if the routine kept it elsewhere.
    pub fn subscribe(
        &self,
        topic: &str,
        capacity: NonZeroUsize,
    ) -> Result<Subscription, SubscribeError> {
        let subscription = self.transport.subscribe(topic, capacity, &self.isolation)?;
        self.lock_subscriptions().push(subscription.release_handle());
        Ok(subscription)
    }

    /// Returns the number of subscriptions this fixture has created.
    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionRelease>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a line of a worker's output to match `pattern`.
    ///
    /// A timeout or the worker closing its output is an assertion failure.
    pub async fn wait_for_output(
        &self,
        worker: &str,
        pattern: &Regex,
        selector: StreamSelector,
        timeout: Duration,
    ) -> Result<OutputLine, RoutineError> {
        let output = self.output(worker).map_err(RoutineError::unexpected)?;
        output
            .wait_for_line(pattern, selector, timeout)
            .await
            .map_err(|error| {
                let reason = match error {
                    WaitError::Timeout(_) => error.to_string(),
                    WaitError::Closed => "worker closed its output".to_owned(),
                };
                RoutineError::assertion(format!(
                    "pattern `{pattern}` not found in {selector} of `{worker}`: {reason}"
                ))
            })
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let releases = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for release in releases.drain(..) {
            release.release();
        }
    }
}

/// The environment a post-shutdown test runs in.
#[derive(Clone, Debug)]
pub struct ShutdownFixture {
    workers: TerminatedWorkers,
}

impl ShutdownFixture {
    pub(crate) fn new(workers: TerminatedWorkers) -> Self {
        Self { workers }
    }

    /// Returns every worker's exit, in worker order.
    pub fn exits(&self) -> &[WorkerExit] {
        self.workers.exits()
    }

    /// Returns the exit of a worker.
    pub fn exit(&self, worker: &str) -> Result<&WorkerExit, UnknownWorkerError> {
        self.workers
            .exit(worker)
            .ok_or_else(|| UnknownWorkerError(worker.to_owned()))
    }

    /// Returns the final output of a worker.
    pub fn output(&self, worker: &str) -> Result<&Arc<OutputBuffer>, UnknownWorkerError> {
        self.workers
            .outputs()
            .get(worker)
            .ok_or_else(|| UnknownWorkerError(worker.to_owned()))
    }
}
