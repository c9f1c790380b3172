// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captured worker output.

use regex::Regex;
use serde::Deserialize;
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};

/// A standard stream of a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputStream {
    /// Returns the stream name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which streams a search looks at.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamSelector {
    /// Only standard output.
    Stdout,
    /// Only standard error.
    Stderr,
    /// Either stream.
    #[default]
    Any,
}

impl StreamSelector {
    /// Returns true if the selector includes `stream`.
    pub fn matches(self, stream: OutputStream) -> bool {
        match self {
            Self::Stdout => stream == OutputStream::Stdout,
            Self::Stderr => stream == OutputStream::Stderr,
            Self::Any => true,
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::Any => f.write_str("output"),
        }
    }
}

/// A single line of captured output, without its line terminator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputLine {
    /// The stream the line was written to.
    pub stream: OutputStream,
    /// The line.
    pub line: String,
}

/// An error returned by [`OutputBuffer::wait_for_line`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// No matching line arrived within the timeout.
    #[error("no matching line within {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// All streams closed without a matching line.
    #[error("output closed without a matching line")]
    Closed,
}

#[derive(Clone, Copy, Debug)]
struct Progress {
    lines: usize,
    open_streams: usize,
}

/// The output of a single worker, in arrival order.
///
/// Lines are appended by pump tasks reading the worker's pipes. Waiters are notified of every new
/// line and of the closure of every stream.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: Mutex<Vec<OutputLine>>,
    progress: watch::Sender<Progress>,
}

impl OutputBuffer {
    /// Creates a buffer that is closed once `open_streams` streams have been closed.
    pub fn new(open_streams: usize) -> Self {
        let (progress, _) = watch::channel(Progress {
            lines: 0,
            open_streams,
        });
        Self {
            lines: Mutex::new(Vec::new()),
            progress,
        }
    }

    /// Appends a line and notifies waiters.
    pub fn push(&self, stream: OutputStream, line: impl Into<String>) {
        let len = {
            let mut lines = self.lock();
            lines.push(OutputLine {
                stream,
                line: line.into(),
            });
            lines.len()
        };
        self.progress.send_modify(|progress| progress.lines = len);
    }

    /// Marks one stream as closed.
    pub fn close_stream(&self) {
        self.progress.send_modify(|progress| {
            progress.open_streams = progress.open_streams.saturating_sub(1);
        });
    }

    /// Returns true once every stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.progress.borrow().open_streams == 0
    }

    /// Returns the number of lines captured so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no lines have been captured.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns a snapshot of the lines captured so far.
    pub fn lines(&self) -> Vec<OutputLine> {
        self.lock().clone()
    }

    /// Returns the first captured line matching `pattern` on the selected streams.
    pub fn find(&self, pattern: &Regex, selector: StreamSelector) -> Option<OutputLine> {
        let mut scanned = 0;
        self.scan(&mut scanned, pattern, selector)
    }

    /// Returns true if any captured line matches `pattern` on the selected streams.
    pub fn contains(&self, pattern: &Regex, selector: StreamSelector) -> bool {
        self.find(pattern, selector).is_some()
    }

    /// Waits for a line matching `pattern`, looking at already-captured lines first.
    pub async fn wait_for_line(
        &self,
        pattern: &Regex,
        selector: StreamSelector,
        timeout: Duration,
    ) -> Result<OutputLine, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut receiver = self.progress.subscribe();
        let mut scanned = 0;
        loop {
            // Mark the current state as seen before scanning, so that a line pushed during the
            // scan wakes the wait below.
            let progress = *receiver.borrow_and_update();
            if let Some(line) = self.scan(&mut scanned, pattern, selector) {
                return Ok(line);
            }
            if progress.open_streams == 0 {
                return Err(WaitError::Closed);
            }
            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(WaitError::Closed),
                Err(_) => return Err(WaitError::Timeout(timeout)),
            }
        }
    }

    fn scan(
        &self,
        scanned: &mut usize,
        pattern: &Regex,
        selector: StreamSelector,
    ) -> Option<OutputLine> {
        let lines = self.lock();
        let found = lines[*scanned..]
            .iter()
            .find(|line| selector.matches(line.stream) && pattern.is_match(&line.line))
            .cloned();
        *scanned = lines.len();
        found
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutputLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
