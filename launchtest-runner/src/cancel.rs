// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run cancellation.

use crate::signal::ShutdownEvent;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::watch;

/// The reason a run was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// The global timeout elapsed.
    GlobalTimeout(Duration),

    /// A shutdown signal was received.
    Signal(ShutdownEvent),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalTimeout(timeout) => write!(
                f,
                "global timeout of {} elapsed",
                humantime::format_duration(*timeout)
            ),
            Self::Signal(event) => write!(f, "received {event}"),
        }
    }
}

/// A cancellation flag shared between a run and the tasks it spawns.
///
/// The first reason passed to [`cancel`](Self::cancel) wins.
#[derive(Clone, Debug)]
pub struct CancelToken {
    sender: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancels the token. Returns true if this call cancelled it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Returns the cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.sender.borrow()
    }

    /// Returns true if the token is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(reason) = *receiver.borrow_and_update() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                // The sender lives in self, so this is unreachable in practice.
                return std::future::pending().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
