// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Observing topics published by workers.
//!
//! launchtest doesn't implement a pub/sub transport. Topics are observed either through an external
//! echo command ([`CommandTransport`]), or through an in-process bus that library users publish to
//! directly ([`ChannelTransport`]).

use crate::{
    errors::SubscribeError,
    isolation::{IsolationEnv, IsolationId},
};
use debug_ignore::DebugIgnore;
use std::{
    collections::HashMap,
    fmt,
    num::NonZeroUsize,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Child,
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

/// The placeholder replaced by the topic name in an echo command.
pub const TOPIC_PLACEHOLDER: &str = "{topic}";

/// The default echo command.
pub const DEFAULT_ECHO_COMMAND: [&str; 5] = ["ros2", "topic", "echo", "--csv", TOPIC_PLACEHOLDER];

/// The largest capacity a subscription may have. Channel slots are allocated up front.
pub const MAX_SUBSCRIPTION_CAPACITY: usize = 1 << 20;

fn check_capacity(topic: &str, capacity: NonZeroUsize) -> Result<usize, SubscribeError> {
    if capacity.get() > MAX_SUBSCRIPTION_CAPACITY {
        return Err(SubscribeError::CapacityTooLarge {
            topic: topic.to_owned(),
            capacity: capacity.get(),
        });
    }
    Ok(capacity.get())
}

/// A source of topic subscriptions.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Subscribes to `topic` under the given isolation env.
    ///
    /// The subscription keeps the last `capacity` unread messages (rounded up to a power of two):
    /// when it overflows, the oldest messages are dropped.
    fn subscribe(
        &self,
        topic: &str,
        capacity: NonZeroUsize,
        isolation: &IsolationEnv,
    ) -> Result<Subscription, SubscribeError>;
}

/// A subscription to a topic. Dropping it releases the underlying resources.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<String>,
    released: watch::Receiver<bool>,
    release: SubscriptionRelease,
    dropped: u64,
    closed: bool,
}

impl Subscription {
    fn new(topic: &str, receiver: broadcast::Receiver<String>, release: SubscriptionRelease) -> Self {
        Self {
            topic: topic.to_owned(),
            receiver,
            released: release.released.subscribe(),
            release,
            dropped: 0,
            closed: false,
        }
    }

    /// Returns the topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns a handle that releases this subscription from elsewhere.
    pub fn release_handle(&self) -> SubscriptionRelease {
        self.release.clone()
    }

    /// Returns the number of messages lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns true if the publisher side has gone away or the subscription was released.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Receives the next message, or `None` once the publisher side has gone away and every
    /// buffered message has been received.
    ///
    /// After the subscription is released, returns `None` immediately.
    pub async fn recv(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        loop {
            let result = tokio::select! {
                biased;
                _ = self.released.wait_for(|released| *released) => None,
                result = self.receiver.recv() => Some(result),
            };
            match result {
                Some(Ok(message)) => return Some(message),
                Some(Err(RecvError::Lagged(count))) => self.dropped += count,
                Some(Err(RecvError::Closed)) | None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Collects messages for the duration of `window`.
    ///
    /// Returns early if the publisher side goes away.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<String> {
        let deadline = Instant::now() + window;
        let mut messages = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) | Err(_) => return messages,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release.release();
    }
}

/// Releases a [`Subscription`]: stops its echo command and closes it for receiving. Releasing
/// more than once has no further effect.
#[derive(Clone, Debug)]
pub struct SubscriptionRelease {
    released: Arc<watch::Sender<bool>>,
    guard: Arc<Mutex<Option<EchoGuard>>>,
}

impl SubscriptionRelease {
    fn new(guard: Option<EchoGuard>) -> Self {
        Self {
            released: Arc::new(watch::Sender::new(false)),
            guard: Arc::new(Mutex::new(guard)),
        }
    }

    /// Releases the subscription.
    pub fn release(&self) {
        self.released.send_replace(true);
        // Dropping the guard stops the echo command.
        drop(self.guard.lock().unwrap_or_else(PoisonError::into_inner).take());
    }

    /// Returns true if the subscription has been released.
    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }
}

#[derive(Debug)]
struct EchoGuard {
    child: Child,
    reader: JoinHandle<()>,
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        self.reader.abort();
        _ = self.child.start_kill();
    }
}

/// A transport that runs an external echo command per subscription.
///
/// Each line the command writes to stdout is one message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandTransport {
    echo_command: Vec<String>,
}

impl CommandTransport {
    /// Creates a new transport. Occurrences of [`TOPIC_PLACEHOLDER`] in `echo_command` are replaced
    /// with the topic name.
    pub fn new(echo_command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            echo_command: echo_command.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the echo command template.
    pub fn echo_command(&self) -> &[String] {
        &self.echo_command
    }

    fn command_for(&self, topic: &str) -> Vec<String> {
        self.echo_command
            .iter()
            .map(|arg| arg.replace(TOPIC_PLACEHOLDER, topic))
            .collect()
    }
}

impl Transport for CommandTransport {
    fn subscribe(
        &self,
        topic: &str,
        capacity: NonZeroUsize,
        isolation: &IsolationEnv,
    ) -> Result<Subscription, SubscribeError> {
        let capacity = check_capacity(topic, capacity)?;
        let args = self.command_for(topic);
        let Some((program, rest)) = args.split_first() else {
            return Err(SubscribeError::EmptyCommand {
                topic: topic.to_owned(),
            });
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        isolation.apply(&mut cmd);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| SubscribeError::Spawn {
            topic: topic.to_owned(),
            command: args.join(" "),
            error,
        })?;
        debug!(topic, pid = child.id(), "started echo command");

        let (sender, receiver) = broadcast::channel(capacity);
        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            // The sender is dropped when the echo command exits, closing the subscription.
            while let Ok(Some(line)) = lines.next_line().await {
                _ = sender.send(line);
            }
        });

        Ok(Subscription::new(
            topic,
            receiver,
            SubscriptionRelease::new(Some(EchoGuard { child, reader })),
        ))
    }
}

/// An in-process transport.
///
/// Messages published under one isolation id are only received by subscribers under the same id.
#[derive(Clone, Debug, Default)]
pub struct ChannelTransport {
    topics: Arc<Mutex<HashMap<(IsolationId, String), Vec<ChannelSubscriber>>>>,
}

#[derive(Debug)]
struct ChannelSubscriber {
    sender: DebugIgnore<broadcast::Sender<String>>,
    release: SubscriptionRelease,
}

impl ChannelSubscriber {
    fn is_live(&self) -> bool {
        self.sender.receiver_count() > 0 && !self.release.is_released()
    }
}

impl ChannelTransport {
    /// Creates a new, empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a message on `topic` under `isolation`, returning the number of subscriptions it
    /// was delivered to.
    pub fn publish(&self, isolation: IsolationId, topic: &str, message: impl Into<String>) -> usize {
        let message = message.into();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = topics.get_mut(&(isolation, topic.to_owned())) else {
            return 0;
        };
        senders.retain(ChannelSubscriber::is_live);
        senders
            .iter()
            .filter(|subscriber| subscriber.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Returns the number of live subscriptions to `topic` under `isolation`.
    pub fn subscriber_count(&self, isolation: IsolationId, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&(isolation, topic.to_owned()))
            .map_or(0, |senders| {
                senders
                    .iter()
                    .filter(|subscriber| subscriber.is_live())
                    .count()
            })
    }
}

impl Transport for ChannelTransport {
    fn subscribe(
        &self,
        topic: &str,
        capacity: NonZeroUsize,
        isolation: &IsolationEnv,
    ) -> Result<Subscription, SubscribeError> {
        let capacity = check_capacity(topic, capacity)?;
        // Each subscription gets its own channel so that capacities are independent.
        let (sender, receiver) = broadcast::channel(capacity);
        let release = SubscriptionRelease::new(None);
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry((isolation.id(), topic.to_owned()))
            .or_default()
            .push(ChannelSubscriber {
                sender: DebugIgnore(sender),
                release: release.clone(),
            });
        Ok(Subscription::new(topic, receiver, release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(id: u32) -> IsolationEnv {
        IsolationEnv::new("TEST_ISOLATION_ID", IsolationId::new(id))
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[tokio::test]
    async fn channel_respects_isolation() {
        let transport = ChannelTransport::new();
        let mut a = transport
            .subscribe("/chatter", capacity(10), &env(1))
            .expect("subscribe succeeds");
        let mut b = transport
            .subscribe("/chatter", capacity(10), &env(2))
            .expect("subscribe succeeds");

        assert_eq!(transport.publish(IsolationId::new(1), "/chatter", "one"), 1);
        assert_eq!(transport.publish(IsolationId::new(2), "/chatter", "two"), 1);
        assert_eq!(transport.publish(IsolationId::new(3), "/chatter", "three"), 0);

        assert_eq!(a.recv().await.as_deref(), Some("one"));
        assert_eq!(b.recv().await.as_deref(), Some("two"));
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let transport = ChannelTransport::new();
        let error = transport
            .subscribe("/chatter", capacity(1 << 62), &env(1))
            .expect_err("capacity is too large");
        assert!(
            matches!(error, SubscribeError::CapacityTooLarge { capacity, .. } if capacity == 1 << 62),
            "unexpected error: {error}"
        );
        assert_eq!(transport.subscriber_count(IsolationId::new(1), "/chatter"), 0);

        let command = CommandTransport::new(vec!["true".to_owned()]);
        assert!(matches!(
            command.subscribe("/chatter", capacity(MAX_SUBSCRIPTION_CAPACITY + 1), &env(1)),
            Err(SubscribeError::CapacityTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn released_subscription_stops_receiving() {
        let transport = ChannelTransport::new();
        let mut sub = transport
            .subscribe("/chatter", capacity(10), &env(1))
            .expect("subscribe succeeds");
        let release = sub.release_handle();
        assert_eq!(transport.subscriber_count(IsolationId::new(1), "/chatter"), 1);

        release.release();
        assert!(release.is_released());
        assert_eq!(transport.subscriber_count(IsolationId::new(1), "/chatter"), 0);
        assert_eq!(transport.publish(IsolationId::new(1), "/chatter", "late"), 0);
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn channel_keeps_last_on_overflow() {
        let transport = ChannelTransport::new();
        let mut sub = transport
            .subscribe("/chatter", capacity(4), &env(1))
            .expect("subscribe succeeds");
        for i in 0..6 {
            transport.publish(IsolationId::new(1), "/chatter", format!("msg {i}"));
        }

        let messages = sub.collect_for(Duration::from_millis(50)).await;
        assert_eq!(messages, ["msg 2", "msg 3", "msg 4", "msg 5"]);
        assert_eq!(sub.dropped(), 2);
        assert!(!sub.is_closed());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let transport = ChannelTransport::new();
        let sub = transport
            .subscribe("/chatter", capacity(1), &env(1))
            .expect("subscribe succeeds");
        assert_eq!(transport.subscriber_count(IsolationId::new(1), "/chatter"), 1);
        drop(sub);
        assert_eq!(transport.subscriber_count(IsolationId::new(1), "/chatter"), 0);
        assert_eq!(transport.publish(IsolationId::new(1), "/chatter", "lost"), 0);
    }

    #[test]
    fn command_substitutes_topic() {
        let transport = CommandTransport::new(["ros2", "topic", "echo", "--csv", "{topic}"]);
        assert_eq!(
            transport.command_for("/chatter"),
            ["ros2", "topic", "echo", "--csv", "/chatter"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_transport_reads_lines() {
        let transport = CommandTransport::new([
            "sh",
            "-c",
            "echo \"$TEST_ISOLATION_ID:{topic}\"; echo second",
        ]);
        let mut sub = transport
            .subscribe("/chatter", capacity(10), &env(7))
            .expect("subscribe succeeds");
        let messages = sub.collect_for(Duration::from_secs(10)).await;
        assert_eq!(messages, ["7:/chatter", "second"]);
        assert!(sub.is_closed(), "echo command exited");
    }

    #[test]
    fn empty_command_is_an_error() {
        let transport = CommandTransport::new(Vec::<String>::new());
        let error = transport
            .subscribe("/chatter", capacity(1), &env(1))
            .expect_err("empty command");
        assert!(matches!(error, SubscribeError::EmptyCommand { .. }));
    }
}
