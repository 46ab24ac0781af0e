//! Consumer client: subscriptions, flow control, and acknowledgment

use crate::config::NsqConfig;
use crate::connection::Connection;
use crate::entity::{Address, Disposition, NsqMessage, Topic};
use crate::error::NsqError;
use crate::lookup::{AccessType, ConfigAgent, LookupResolver};
use crate::metrics::global_metrics;
use crate::protocol::{Command, OK};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Per-message callback invoked on the dispatch pool.
///
/// Returning an error leaves the message unacknowledged; it requeues through
/// the broker's timeout and redelivers with an incremented attempt count.
/// Closures with the matching signature implement this trait directly.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &NsqMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> MessageHandler for F
where
    F: Fn(&NsqMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
    fn handle(&self, message: &NsqMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(message)
    }
}

struct ConsumerInner {
    config: Arc<NsqConfig>,
    resolver: Arc<LookupResolver>,
    handler: Arc<dyn MessageHandler>,
    subscriptions: Mutex<Vec<Topic>>,
    auto_finish: AtomicBool,
    dispatch: Arc<Semaphore>,
    cancel: tokio_util::sync::CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Subscribes to topics and drives flow-controlled, at-least-once delivery.
///
/// In ordered mode exactly one connection is bound per partition for the
/// whole session, in-flight credit is one, and the handler observes broker
/// send order per partition.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Create a consumer. The configuration must name a channel; `agent` is
    /// required unless lookup addresses are pinned.
    pub fn new(
        config: NsqConfig,
        handler: Arc<dyn MessageHandler>,
        agent: Option<Arc<ConfigAgent>>,
    ) -> Result<Self, NsqError> {
        if config.channel().is_none() {
            return Err(NsqError::validation("consumer requires a channel name"));
        }
        let resolver = Arc::new(LookupResolver::for_config(&config, agent)?);
        let config = Arc::new(config);
        let dispatch = Arc::new(Semaphore::new(config.io_concurrency));
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                config,
                resolver,
                handler,
                subscriptions: Mutex::new(Vec::new()),
                auto_finish: AtomicBool::new(true),
                dispatch,
                cancel: tokio_util::sync::CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::default()
    }

    /// Finish messages automatically after a clean handler return (default).
    /// With auto-finish off, the handler must call `finish`/`requeue`
    /// itself or the message requeues on timeout.
    pub fn set_auto_finish(&self, auto_finish: bool) {
        self.inner.auto_finish.store(auto_finish, Ordering::Release);
    }

    /// Register a topic, optionally pinned to one partition. Must precede
    /// [`start`](Self::start).
    pub fn subscribe(&self, topic: Topic) -> Result<(), NsqError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NsqError::Closed);
        }
        if self.inner.started.load(Ordering::Acquire) {
            return Err(NsqError::validation("subscribe must precede start"));
        }
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.contains(&topic) {
            subscriptions.push(topic);
        }
        Ok(())
    }

    /// Resolve all subscribed topics and start the delivery loops.
    pub async fn start(&self) -> Result<(), NsqError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NsqError::Closed);
        }
        let subscriptions = self.inner.subscriptions.lock().clone();
        if subscriptions.is_empty() {
            return Err(NsqError::validation("no topics subscribed"));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(NsqError::validation("consumer already started"));
        }

        let mut handles = Vec::new();
        for topic in subscriptions {
            let addresses = self
                .inner
                .resolver
                .lookup(topic.name(), AccessType::Read)
                .await?;
            let bound: Vec<Address> = match topic.partition() {
                Some(pinned) => {
                    let address = addresses
                        .iter()
                        .find(|a| a.partition == pinned)
                        .cloned()
                        .ok_or_else(|| {
                            NsqError::lookup(format!(
                                "partition {} of topic {} is not available",
                                pinned,
                                topic.name()
                            ))
                        })?;
                    vec![address]
                }
                None => addresses.as_ref().clone(),
            };
            if bound.is_empty() {
                warn!(topic = %topic, "topic has no read partitions yet");
            }
            for address in bound {
                let inner = self.inner.clone();
                let topic = topic.clone();
                handles.push(tokio::spawn(delivery_loop(inner, topic, address)));
            }
        }
        self.inner.tasks.lock().await.extend(handles);
        info!("consumer started");
        Ok(())
    }

    /// Disconnect, cancel the delivery loops, and wait for them to settle.
    /// Idempotent and callable from any task.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("consumer closed");
    }
}

/// One delivery loop per bound partition endpoint. Reconnects with bounded
/// backoff against a freshly resolved address; the partition binding itself
/// never moves.
async fn delivery_loop(inner: Arc<ConsumerInner>, topic: Topic, mut address: Address) {
    let retry = inner.config.retry.clone();
    let mut failures: usize = 0;
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        match run_connection(&inner, &address, &mut failures).await {
            Ok(()) => return,
            Err(e) if !e.is_retryable() => {
                error!(address = %address, error = %e, "subscription failed permanently");
                return;
            }
            Err(e) => {
                failures += 1;
                if failures > retry.max_retries {
                    error!(
                        address = %address,
                        attempts = failures,
                        error = %e,
                        "giving up on partition after repeated failures"
                    );
                    return;
                }
                let backoff = retry.backoff(failures);
                warn!(
                    address = %address,
                    attempt = failures,
                    backoff = ?backoff,
                    error = %e,
                    "subscription interrupted, reconnecting"
                );
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                // Same partition, fresh endpoint data.
                if let Ok(addresses) = inner
                    .resolver
                    .refresh(topic.name(), AccessType::Read)
                    .await
                {
                    if let Some(fresh) = addresses.iter().find(|a| a.partition == address.partition)
                    {
                        address = fresh.clone();
                    }
                }
            }
        }
    }
}

async fn run_connection(
    inner: &Arc<ConsumerInner>,
    address: &Address,
    failures: &mut usize,
) -> Result<(), NsqError> {
    let config = &inner.config;
    let conn = Connection::open(address, config).await?;
    let features = conn.features();
    let tag = config.desired_tag().map(|t| t.as_str().to_string());
    if tag.is_some() && !features.extend_support {
        conn.close();
        return Err(NsqError::feature_unsupported(format!(
            "broker {} did not negotiate tag support",
            address
        )));
    }

    let ordered = config.ordered() || address.ordered;
    let channel = config
        .channel()
        .expect("channel validated at construction")
        .to_string();
    let subscribe = Command::Subscribe {
        topic: address.topic.clone(),
        partition: address.partition,
        channel,
        ordered,
        tag,
    };
    let reply = timeout(config.query_timeout, conn.command(subscribe))
        .await
        .map_err(|_| NsqError::connection(format!("subscribe to {} timed out", address)))??;
    if &reply[..] != OK {
        conn.close();
        return Err(NsqError::protocol(format!(
            "unexpected subscribe reply: {}",
            String::from_utf8_lossy(&reply)
        )));
    }
    *failures = 0;

    let mut messages = conn
        .take_messages()
        .ok_or_else(|| NsqError::protocol("message stream already taken"))?;
    // Ordered partitions run with credit 1 so order survives dispatch.
    let rdy = if ordered {
        1
    } else {
        config.rdy().min(features.max_rdy).max(1)
    };
    let credit = conn.credit();
    credit.store(rdy as i64, Ordering::SeqCst);
    conn.send(Command::Rdy(rdy))?;
    debug!(address = %address, rdy, ordered, "subscribed");

    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Disposition>();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                conn.close();
                return Ok(());
            }
            Some(disposition) = ack_rx.recv() => {
                apply_disposition(&conn, disposition, ordered, &credit)?;
            }
            frame = messages.recv() => {
                match frame {
                    Some(frame) => {
                        global_metrics().record_consume(frame.body.len() as u64);
                        credit.fetch_sub(1, Ordering::SeqCst);
                        let message = Arc::new(NsqMessage::new(
                            frame.id,
                            frame.timestamp,
                            frame.attempts,
                            frame.body,
                            frame.tag,
                            address.partition,
                            ack_tx.clone(),
                        ));
                        if ordered {
                            // Strictly sequential: the next frame is not read
                            // until this message reaches a terminal state.
                            process_message(inner, message, None).await;
                        } else {
                            let permit = inner
                                .dispatch
                                .clone()
                                .acquire_owned()
                                .await
                                .map_err(|_| NsqError::Closed)?;
                            let worker = inner.clone();
                            tokio::spawn(async move {
                                process_message(&worker, message, Some(permit)).await;
                            });
                        }
                    }
                    None => {
                        if inner.cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(NsqError::connection(format!(
                            "connection to {} lost",
                            address
                        )));
                    }
                }
            }
        }
    }
}

/// Forward a terminal disposition to the broker and restore local credit.
fn apply_disposition(
    conn: &Connection,
    disposition: Disposition,
    ordered: bool,
    credit: &AtomicI64,
) -> Result<(), NsqError> {
    match disposition {
        Disposition::Finish(id) => {
            conn.send(Command::Fin(id))?;
            global_metrics().record_finish();
        }
        Disposition::Requeue(id, delay) => {
            conn.send(Command::Requeue(id, delay.as_millis() as u64))?;
            global_metrics().record_requeue();
        }
        Disposition::Expired(id) => {
            // The broker requeues on its own timer; only local credit moves.
            debug!(id = %id, "message expired locally");
        }
    }
    credit.fetch_add(1, Ordering::SeqCst);
    if ordered {
        // Explicit re-grant keeps the one-in-flight window airtight.
        conn.send(Command::Rdy(1))?;
    }
    Ok(())
}

/// Run the handler and shepherd the message to a terminal state.
///
/// The dispatch permit is held only while the handler runs; the in-flight
/// accounting is carried by the credit counter until disposition or timeout.
async fn process_message(
    inner: &Arc<ConsumerInner>,
    message: Arc<NsqMessage>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let handler = inner.handler.clone();
    let for_handler = message.clone();
    let result = tokio::task::spawn_blocking(move || handler.handle(&for_handler)).await;
    drop(permit);

    match result {
        Ok(Ok(())) => {
            if inner.auto_finish.load(Ordering::Acquire) && !message.is_terminated() {
                message.finish();
            }
        }
        Ok(Err(e)) => {
            global_metrics().record_handler_error();
            warn!(
                id = %message.id(),
                attempts = message.attempts(),
                error = %e,
                "handler failed, message requeues on timeout"
            );
        }
        Err(e) => {
            global_metrics().record_handler_error();
            error!(id = %message.id(), error = %e, "handler panicked");
        }
    }

    if message.is_terminated() {
        return;
    }
    tokio::select! {
        _ = message.wait_terminated() => {}
        _ = tokio::time::sleep(inner.config.msg_timeout()) => {
            warn!(
                id = %message.id(),
                "message unacknowledged past timeout, broker requeues"
            );
            message.expire();
        }
        _ = inner.cancel.cancelled() => {
            message.expire();
        }
    }
}

/// Builder for [`Consumer`]
#[derive(Default)]
pub struct ConsumerBuilder {
    config: Option<NsqConfig>,
    agent: Option<Arc<ConfigAgent>>,
    handler: Option<Arc<dyn MessageHandler>>,
    auto_finish: Option<bool>,
}

impl ConsumerBuilder {
    pub fn config(mut self, config: NsqConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject the discovery agent used when lookup addresses are not pinned.
    pub fn config_agent(mut self, agent: Arc<ConfigAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn handler<H: MessageHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn auto_finish(mut self, auto_finish: bool) -> Self {
        self.auto_finish = Some(auto_finish);
        self
    }

    pub fn build(self) -> Result<Consumer, NsqError> {
        let config = self.config.unwrap_or_default();
        let handler = self
            .handler
            .ok_or_else(|| NsqError::validation("consumer requires a message handler"))?;
        let consumer = Consumer::new(config, handler, self.agent)?;
        if let Some(auto_finish) = self.auto_finish {
            consumer.set_auto_finish(auto_finish);
        }
        Ok(consumer)
    }
}
