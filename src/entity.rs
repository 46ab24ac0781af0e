//! Value types: broker addresses, topics, and messages

use crate::config::DesiredTag;
use bytes::Bytes;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// One broker partition endpoint, as resolved by the lookup service.
///
/// Equality and hashing cover host, port, and partition only; the pool keys
/// on those three.
#[derive(Debug, Clone)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub topic: String,
    pub partition: i32,
    pub ordered: bool,
}

impl Address {
    pub fn new<H, V, T>(host: H, port: u16, version: V, topic: T, partition: i32, ordered: bool) -> Self
    where
        H: Into<String>,
        V: Into<String>,
        T: Into<String>,
    {
        Self {
            host: host.into(),
            port,
            version: version.into(),
            topic: topic.into(),
            partition,
            ordered,
        }
    }

    /// `host:port` socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.partition == other.partition
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.partition.hash(state);
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}-{}",
            self.host, self.port, self.topic, self.partition
        )
    }
}

/// A topic, optionally pinned to a single partition and optionally carrying
/// a sharding identifier for ordered publish.
///
/// Equality and hashing cover name and partition.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    partition: Option<i32>,
    sharding: Option<i64>,
}

impl Topic {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            partition: None,
            sharding: None,
        }
    }

    /// Pin all operations on this topic to one partition.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Default sharding id applied to messages without one of their own.
    pub fn with_sharding(mut self, sharding_id: i64) -> Self {
        self.sharding = Some(sharding_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> Option<i32> {
        self.partition
    }

    pub fn sharding(&self) -> Option<i64> {
        self.sharding
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.partition == other.partition
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.partition.hash(state);
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}#{}", self.name, p),
            None => f.write_str(&self.name),
        }
    }
}

/// A message to publish. Created by the caller, consumed once by
/// `Producer::publish`.
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) topic: Topic,
    pub(crate) body: Bytes,
    pub(crate) tag: Option<DesiredTag>,
    pub(crate) sharding_id: Option<i64>,
}

impl Message {
    pub fn new<B: Into<Bytes>>(topic: Topic, body: B) -> Self {
        Self {
            topic,
            body: body.into(),
            tag: None,
            sharding_id: None,
        }
    }

    /// Attach a tag for selective delivery.
    pub fn with_tag(mut self, tag: DesiredTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Route this message by sharding id: same id, same partition, as long
    /// as the partition count is stable.
    pub fn with_sharding(mut self, sharding_id: i64) -> Self {
        self.sharding_id = Some(sharding_id);
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Sharding id in effect: the message's own, falling back to the topic's.
    pub fn effective_sharding(&self) -> Option<i64> {
        self.sharding_id.or(self.topic.sharding)
    }
}

/// 16-byte broker-assigned message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Outcome reported back to the delivery loop for a delivered message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Disposition {
    Finish(MessageId),
    Requeue(MessageId, Duration),
    /// Acknowledgment window elapsed; the broker requeues on its own and
    /// only local credit is restored.
    Expired(MessageId),
}

pub(crate) type DispositionTx = mpsc::UnboundedSender<Disposition>;

#[derive(Debug)]
struct AckState {
    terminated: AtomicBool,
    notify: Notify,
}

/// A message delivered to a consumer.
///
/// Terminated by exactly one of [`finish`](Self::finish),
/// [`requeue`](Self::requeue), or [`ignore`](Self::ignore); the first
/// disposition wins and later calls are no-ops. A message left open past the
/// configured timeout is requeued by the broker and can no longer be
/// acknowledged.
#[derive(Debug)]
pub struct NsqMessage {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Bytes,
    tag: Option<String>,
    partition: i32,
    ack: AckState,
    tx: DispositionTx,
}

impl NsqMessage {
    pub(crate) fn new(
        id: MessageId,
        timestamp: i64,
        attempts: u16,
        body: Bytes,
        tag: Option<String>,
        partition: i32,
        tx: DispositionTx,
    ) -> Self {
        Self {
            id,
            timestamp,
            attempts,
            body,
            tag,
            partition,
            ack: AckState {
                terminated: AtomicBool::new(false),
                notify: Notify::new(),
            },
            tx,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Broker receive timestamp, nanoseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Delivery attempt count, 1 on first delivery.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body interpreted as UTF-8, lossily.
    pub fn readable_body(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Tag the message was published with, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Acknowledge successful processing.
    pub fn finish(&self) {
        self.terminate(Disposition::Finish(self.id));
    }

    /// Hand the message back for redelivery after `delay`.
    pub fn requeue(&self, delay: Duration) {
        self.terminate(Disposition::Requeue(self.id, delay));
    }

    /// Discard without processing. Acknowledged to the broker like a finish
    /// so it is not redelivered.
    pub fn ignore(&self) {
        tracing::debug!(id = %self.id, "message ignored");
        self.terminate(Disposition::Finish(self.id));
    }

    pub fn is_terminated(&self) -> bool {
        self.ack.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn expire(&self) {
        self.terminate(Disposition::Expired(self.id));
    }

    /// Resolves once the message reaches a terminal disposition.
    pub(crate) async fn wait_terminated(&self) {
        loop {
            let notified = self.ack.notify.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    fn terminate(&self, disposition: Disposition) {
        if self.ack.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        // The delivery loop may already be gone on shutdown; the broker's
        // timeout covers redelivery in that case.
        let _ = self.tx.send(disposition);
        self.ack.notify.notify_waiters();
    }
}
