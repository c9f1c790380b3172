// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by launchtest.

use camino::Utf8PathBuf;
use config::ConfigError;
use launchtest_metadata::ReportFormatError;
use std::{error, fmt};
use thiserror::Error;

/// An error that occurred while parsing a suite file.
#[derive(Debug, Error)]
#[error("failed to parse suite file at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the suite file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of suite file parse error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// The suite file could not be read or was not valid TOML.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// The suite file did not match the expected schema.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// The suite file parsed, but describes an invalid suite.
    #[error(transparent)]
    Validation(#[from] SuiteValidationError),
}

/// A suite description is structurally valid but semantically wrong.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteValidationError {
    /// The suite name is empty or contains a path separator.
    #[error("invalid suite name `{name}`: must be non-empty and not contain `/` or `\\`")]
    InvalidSuiteName {
        /// The name.
        name: String,
    },

    /// A worker has an empty name.
    #[error("worker at index {index} has an empty name")]
    EmptyWorkerName {
        /// The index of the worker.
        index: usize,
    },

    /// Two workers share a name.
    #[error("duplicate worker name `{name}`")]
    DuplicateWorker {
        /// The name.
        name: String,
    },

    /// A worker has no command.
    #[error("worker `{worker}` has an empty command")]
    EmptyCommand {
        /// The worker.
        worker: String,
    },

    /// A worker environment entry isn't of the form `KEY=VALUE`.
    #[error("worker `{worker}` has an invalid env entry `{entry}` (expected KEY=VALUE)")]
    InvalidEnv {
        /// The worker.
        worker: String,
        /// The entry.
        entry: String,
    },

    /// A test has an empty name.
    #[error("{phase} test at index {index} has an empty name")]
    EmptyTestName {
        /// The phase of the test.
        phase: &'static str,
        /// The index of the test within its phase.
        index: usize,
    },

    /// Two tests share a name.
    #[error("duplicate test name `{name}`")]
    DuplicateTest {
        /// The name.
        name: String,
    },

    /// A test refers to a worker that isn't defined.
    #[error("test `{test}` refers to unknown worker `{worker}`")]
    UnknownWorker {
        /// The test.
        test: String,
        /// The worker.
        worker: String,
    },

    /// A test's pattern isn't a valid regex.
    #[error("test `{test}` has an invalid pattern")]
    InvalidPattern {
        /// The test.
        test: String,
        /// The regex error.
        #[source]
        error: regex::Error,
    },

    /// A message-count test has a zero capacity.
    #[error("test `{test}` has a capacity of 0")]
    ZeroCapacity {
        /// The test.
        test: String,
    },

    /// A message-count test has a capacity above the maximum.
    #[error(
        "test `{test}` has a capacity of {capacity}, above the maximum of {}",
        crate::transport::MAX_SUBSCRIPTION_CAPACITY
    )]
    CapacityTooLarge {
        /// The test.
        test: String,
        /// The capacity.
        capacity: usize,
    },

    /// A message-count test has `min-count > max-count`.
    #[error("test `{test}` has min-count {min} greater than max-count {max}")]
    CountRange {
        /// The test.
        test: String,
        /// The minimum.
        min: usize,
        /// The maximum.
        max: usize,
    },

    /// The transport echo command is empty.
    #[error("transport echo-command is empty")]
    EmptyEchoCommand,

    /// The isolation id range is empty.
    #[error("isolation id-range {start}..={end} is empty")]
    EmptyIdRange {
        /// The start of the range.
        start: u32,
        /// The end of the range.
        end: u32,
    },

    /// The isolation id range doesn't fit above the lock port base.
    #[error("isolation lock-port-base {base} + id-range end {end} exceeds the maximum port")]
    PortOverflow {
        /// The port base.
        base: u16,
        /// The end of the id range.
        end: u32,
    },
}

/// An error that occurred while leasing an isolation id.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IsolationError {
    /// Every id in the range is in use.
    #[error("all isolation ids in {start}..={end} are in use")]
    Exhausted {
        /// The start of the range.
        start: u32,
        /// The end of the range.
        end: u32,
    },

    /// An inherited isolation id was requested, but the environment variable isn't set.
    #[error("isolation id was requested from `{var}`, but it is not set")]
    InheritedMissing {
        /// The environment variable.
        var: String,
    },

    /// An inherited isolation id couldn't be parsed.
    #[error("isolation id `{value}` from `{var}` is not a valid id")]
    InheritedInvalid {
        /// The environment variable.
        var: String,
        /// The value.
        value: String,
    },
}

/// An error that occurred while starting workers. Fatal to the run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// A worker process could not be spawned.
    #[error("worker `{worker}` failed to start (command: `{command}`)")]
    Spawn {
        /// The worker.
        worker: String,
        /// The command line, for display.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// An isolation id could not be leased.
    #[error("failed to lease an isolation id")]
    Isolation(#[from] IsolationError),
}

/// An error that occurred while subscribing to a topic.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubscribeError {
    /// The echo command could not be spawned.
    #[error("failed to start echo command `{command}` for topic `{topic}`")]
    Spawn {
        /// The topic.
        topic: String,
        /// The command line, for display.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The echo command has no program.
    #[error("echo command for topic `{topic}` is empty")]
    EmptyCommand {
        /// The topic.
        topic: String,
    },

    /// The requested capacity is above the maximum.
    #[error(
        "capacity {capacity} for topic `{topic}` exceeds the maximum of {}",
        crate::transport::MAX_SUBSCRIPTION_CAPACITY
    )]
    CapacityTooLarge {
        /// The topic.
        topic: String,
        /// The requested capacity.
        capacity: usize,
    },
}

/// An error that occurred while writing report files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportWriteError {
    /// A filesystem error occurred.
    #[error("error writing to `{path}`")]
    Fs {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The native report could not be serialized.
    #[error("error serializing native report for `{path}`")]
    Native {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: ReportFormatError,
    },

    /// The XUnit report could not be serialized.
    #[error("error serializing XUnit report for `{path}`")]
    Xunit {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: quick_junit::SerializeError,
    },
}

/// An error that occurred while reading a report file during aggregation.
///
/// These never abort aggregation: the file is excluded and counted as unreadable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportParseError {
    /// The file could not be read.
    #[error("error reading `{path}`")]
    Read {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The file is not a valid native report.
    #[error("`{path}` is not a valid launchtest report")]
    Native {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: ReportFormatError,
    },

    /// The file is not a valid XUnit report.
    #[error("`{path}` is not a valid XUnit report")]
    Xunit {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: XunitParseError,
    },
}

impl ReportParseError {
    /// Returns the path of the unreadable file.
    pub fn path(&self) -> &Utf8PathBuf {
        match self {
            Self::Read { path, .. } | Self::Native { path, .. } | Self::Xunit { path, .. } => path,
        }
    }
}

/// An error that occurred while parsing XUnit XML.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum XunitParseError {
    /// The XML is malformed.
    #[error("malformed XML")]
    Xml(#[from] quick_xml::Error),

    /// An attribute is malformed.
    #[error("malformed attribute")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    /// A count attribute isn't a non-negative integer.
    #[error("attribute `{attribute}` on <{element}> has invalid count `{value}`")]
    InvalidCount {
        /// The element.
        element: String,
        /// The attribute.
        attribute: String,
        /// The value.
        value: String,
    },

    /// The document has no `<testsuites>` or `<testsuite>` root.
    #[error("document has no <testsuites> or <testsuite> root element")]
    NoRoot,

    /// The document ended before the root element was closed.
    #[error("document ended before </{element}>")]
    Truncated {
        /// The unclosed element.
        element: String,
    },

    /// A suite's counts are inconsistent.
    #[error("suite `{suite}` reports more errors, failures and skips than tests")]
    InconsistentCounts {
        /// The suite.
        suite: String,
    },

    /// The counts summed over all suites don't fit in a `usize`.
    #[error("counts summed over all suites overflow")]
    CountOverflow,
}

/// An error that occurred while building the test runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),

    /// Two suites share an isolation variable but lock ids through different ports.
    #[error(
        "suites `{first}` and `{second}` both use isolation variable `{env_var}`, \
         but with different lock-port-base values ({first_base} and {second_base})"
    )]
    ConflictingLockPorts {
        /// The isolation environment variable.
        env_var: String,
        /// The first suite.
        first: String,
        /// Its lock port base.
        first_base: u16,
        /// The second suite.
        second: String,
        /// Its lock port base.
        second_base: u16,
    },
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while building a test filter.
#[derive(Debug, Error)]
#[error("error building test filter")]
pub struct TestFilterBuildError(#[from] aho_corasick::BuildError);

/// Displays an error and its chain of sources.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut next = self.0.source();
        if next.is_none() {
            return Ok(());
        }
        write!(f, "\n  caused by:")?;
        while let Some(err) = next {
            write!(f, "\n  - {err}")?;
            next = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_error_chain() {
        let error = LaunchError::Spawn {
            worker: "talker".to_owned(),
            command: "does-not-exist".to_owned(),
            error: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            DisplayErrorChain::new(&error).to_string(),
            "worker `talker` failed to start (command: `does-not-exist`)\n  \
             caused by:\n  - no such file"
        );

        let error = IsolationError::Exhausted { start: 1, end: 2 };
        assert_eq!(
            DisplayErrorChain::new(&error).to_string(),
            "all isolation ids in 1..=2 are in use"
        );
    }
}
