// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suites: workers plus the tests that run against them.

use crate::{
    errors::SuiteValidationError,
    isolation::IsolationSettings,
    launcher::{ShutdownSettings, WorkerSpec},
    routine::{ShutdownRoutine, TestRoutine},
    transport::{CommandTransport, DEFAULT_ECHO_COMMAND, Transport},
};
use launchtest_metadata::TestPhase;
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

/// Timing settings for a suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SuiteSettings {
    /// The time to wait after all workers have started before running active tests.
    pub ready_delay: Duration,

    /// The timeout for each test, in both phases.
    pub test_timeout: Duration,

    /// The timeout for the whole run, if any.
    pub global_timeout: Option<Duration>,
}

impl Default for SuiteSettings {
    fn default() -> Self {
        Self {
            ready_delay: Duration::from_secs(1),
            test_timeout: Duration::from_secs(60),
            global_timeout: None,
        }
    }
}

/// A named test and its routine.
pub struct SuiteTest<R: ?Sized> {
    name: String,
    routine: Arc<R>,
}

impl<R: ?Sized> SuiteTest<R> {
    /// Returns the name of the test.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the routine.
    pub fn routine(&self) -> &Arc<R> {
        &self.routine
    }
}

impl<R: ?Sized> Clone for SuiteTest<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            routine: self.routine.clone(),
        }
    }
}

impl<R: ?Sized + fmt::Debug> fmt::Debug for SuiteTest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteTest")
            .field("name", &self.name)
            .field("routine", &self.routine)
            .finish()
    }
}

/// An active test.
pub type ActiveTest = SuiteTest<dyn TestRoutine>;

/// A post-shutdown test.
pub type PostShutdownTest = SuiteTest<dyn ShutdownRoutine>;

/// A validated suite.
#[derive(Clone, Debug)]
pub struct Suite {
    name: String,
    settings: SuiteSettings,
    isolation: IsolationSettings,
    shutdown: ShutdownSettings,
    workers: Vec<WorkerSpec>,
    active_tests: Vec<ActiveTest>,
    post_shutdown_tests: Vec<PostShutdownTest>,
    transport: Arc<dyn Transport>,
}

impl Suite {
    /// Starts building a suite.
    pub fn builder(name: impl Into<String>) -> SuiteBuilder {
        SuiteBuilder::new(name)
    }

    /// Returns the name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the timing settings.
    pub fn settings(&self) -> &SuiteSettings {
        &self.settings
    }

    /// Returns the isolation settings.
    pub fn isolation(&self) -> &IsolationSettings {
        &self.isolation
    }

    /// Returns the shutdown settings.
    pub fn shutdown(&self) -> &ShutdownSettings {
        &self.shutdown
    }

    /// Returns the workers, in start order.
    pub fn workers(&self) -> &[WorkerSpec] {
        &self.workers
    }

    /// Returns the active tests, in execution order.
    pub fn active_tests(&self) -> &[ActiveTest] {
        &self.active_tests
    }

    /// Returns the post-shutdown tests, in execution order.
    pub fn post_shutdown_tests(&self) -> &[PostShutdownTest] {
        &self.post_shutdown_tests
    }

    /// Returns the names of all tests with their phases, in execution order.
    pub fn test_names(&self) -> impl Iterator<Item = (&str, TestPhase)> {
        self.active_tests
            .iter()
            .map(|test| (test.name(), TestPhase::Active))
            .chain(
                self.post_shutdown_tests
                    .iter()
                    .map(|test| (test.name(), TestPhase::PostShutdown)),
            )
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

/// Builds a [`Suite`].
#[derive(Debug)]
pub struct SuiteBuilder {
    name: String,
    settings: SuiteSettings,
    isolation: IsolationSettings,
    shutdown: ShutdownSettings,
    workers: Vec<WorkerSpec>,
    active_tests: Vec<ActiveTest>,
    post_shutdown_tests: Vec<PostShutdownTest>,
    transport: Option<Arc<dyn Transport>>,
}

impl SuiteBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: SuiteSettings::default(),
            isolation: IsolationSettings::default(),
            shutdown: ShutdownSettings::default(),
            workers: Vec::new(),
            active_tests: Vec::new(),
            post_shutdown_tests: Vec::new(),
            transport: None,
        }
    }

    /// Sets the timing settings.
    pub fn settings(&mut self, settings: SuiteSettings) -> &mut Self {
        self.settings = settings;
        self
    }

    /// Sets the isolation settings.
    pub fn isolation(&mut self, isolation: IsolationSettings) -> &mut Self {
        self.isolation = isolation;
        self
    }

    /// Sets the shutdown settings.
    pub fn shutdown(&mut self, shutdown: ShutdownSettings) -> &mut Self {
        self.shutdown = shutdown;
        self
    }

    /// Sets the transport. Defaults to running `ros2 topic echo`.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Adds a worker.
    pub fn worker(&mut self, worker: WorkerSpec) -> &mut Self {
        self.workers.push(worker);
        self
    }

    /// Adds an active test.
    pub fn active_test(
        &mut self,
        name: impl Into<String>,
        routine: impl TestRoutine + 'static,
    ) -> &mut Self {
        self.active_tests.push(SuiteTest {
            name: name.into(),
            routine: Arc::new(routine),
        });
        self
    }

    /// Adds a post-shutdown test.
    pub fn post_shutdown_test(
        &mut self,
        name: impl Into<String>,
        routine: impl ShutdownRoutine + 'static,
    ) -> &mut Self {
        self.post_shutdown_tests.push(SuiteTest {
            name: name.into(),
            routine: Arc::new(routine),
        });
        self
    }

    /// Validates and builds the suite.
    pub fn build(self) -> Result<Suite, SuiteValidationError> {
        if self.name.is_empty()
            || self.name == "."
            || self.name == ".."
            || self.name.contains(['/', '\\'])
        {
            return Err(SuiteValidationError::InvalidSuiteName { name: self.name });
        }

        let mut worker_names = HashSet::new();
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.name().is_empty() {
                return Err(SuiteValidationError::EmptyWorkerName { index });
            }
            if !worker_names.insert(worker.name()) {
                return Err(SuiteValidationError::DuplicateWorker {
                    name: worker.name().to_owned(),
                });
            }
            if worker.program().is_empty() {
                return Err(SuiteValidationError::EmptyCommand {
                    worker: worker.name().to_owned(),
                });
            }
        }

        let mut test_names = HashSet::new();
        let tests = self
            .active_tests
            .iter()
            .map(|test| (TestPhase::Active, test.name()))
            .enumerate()
            .chain(
                self.post_shutdown_tests
                    .iter()
                    .map(|test| (TestPhase::PostShutdown, test.name()))
                    .enumerate(),
            );
        for (index, (phase, name)) in tests {
            if name.is_empty() {
                return Err(SuiteValidationError::EmptyTestName {
                    phase: phase.as_str(),
                    index,
                });
            }
            if !test_names.insert(name) {
                return Err(SuiteValidationError::DuplicateTest {
                    name: name.to_owned(),
                });
            }
        }

        let range = self.isolation.id_range();
        if range.is_empty() {
            return Err(SuiteValidationError::EmptyIdRange {
                start: *range.start(),
                end: *range.end(),
            });
        }
        let base = self.isolation.lock_port_base();
        if u32::from(base) + *range.end() > u32::from(u16::MAX) {
            return Err(SuiteValidationError::PortOverflow {
                base,
                end: *range.end(),
            });
        }

        Ok(Suite {
            name: self.name,
            settings: self.settings,
            isolation: self.isolation,
            shutdown: self.shutdown,
            workers: self.workers,
            active_tests: self.active_tests,
            post_shutdown_tests: self.post_shutdown_tests,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(CommandTransport::new(DEFAULT_ECHO_COMMAND))),
        })
    }
}
