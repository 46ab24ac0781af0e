//! Broker connections and the per-endpoint connection pool

use crate::config::NsqConfig;
use crate::entity::Address;
use crate::error::NsqError;
use crate::metrics::global_metrics;
use crate::protocol::{Command, Frame, IdentifyResponse, MessageFrame, NsqCodec, HEARTBEAT};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Handshaking = 1,
    Identified = 2,
    Active = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::New,
            1 => ConnState::Handshaking,
            2 => ConnState::Identified,
            3 => ConnState::Active,
            4 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Features echoed by the broker during the identify handshake.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFeatures {
    pub max_rdy: u32,
    pub extend_support: bool,
}

type Completion = oneshot::Sender<Result<Bytes, NsqError>>;
type Outbound = (Command, Option<Completion>);

/// One logical session to a broker partition.
///
/// Owns a spawned IO loop multiplexing command writes, FIFO response
/// matching (broker replies carry no correlation id), pushed message frames,
/// and in-band heartbeat replies. The in-flight credit counter is the only
/// state shared with delivery code and is atomic.
#[derive(Debug)]
pub struct Connection {
    address: Address,
    state: Arc<AtomicU8>,
    features: NegotiatedFeatures,
    command_tx: mpsc::UnboundedSender<Outbound>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<MessageFrame>>>,
    credit: Arc<AtomicI64>,
    cancel: CancellationToken,
}

impl Connection {
    /// Open the transport, run the identify handshake, and start the IO
    /// loop.
    pub async fn open(address: &Address, config: &NsqConfig) -> Result<Self, NsqError> {
        let state = Arc::new(AtomicU8::new(ConnState::New as u8));
        let socket_addr = address.socket_addr();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&socket_addr))
            .await
            .map_err(|_| {
                global_metrics().record_connection_failed();
                NsqError::connection(format!("connect to {} timed out", address))
            })?
            .map_err(|e| {
                global_metrics().record_connection_failed();
                NsqError::connection(format!("failed to connect to {}: {}", address, e))
            })?;
        let _ = stream.set_nodelay(true);

        state.store(ConnState::Handshaking as u8, Ordering::Release);
        let mut framed = Framed::new(stream, NsqCodec::new());
        framed.send(Command::Magic).await?;
        let body = serde_json::to_vec(&config.identify_body())
            .map_err(|e| NsqError::protocol(format!("identify body: {}", e)))?;
        framed.send(Command::Identify(Bytes::from(body))).await?;

        let frame = timeout(config.query_timeout, framed.next())
            .await
            .map_err(|_| NsqError::connection(format!("identify to {} timed out", address)))?
            .ok_or_else(|| NsqError::connection("connection closed during identify"))??;
        let response = match frame {
            Frame::Response(data) if &data[..] == crate::protocol::OK => IdentifyResponse::default(),
            Frame::Response(data) => serde_json::from_slice(&data)
                .map_err(|e| NsqError::protocol(format!("malformed identify response: {}", e)))?,
            Frame::Error(message) => {
                return Err(NsqError::protocol(format!("identify rejected: {}", message)))
            }
            Frame::Message(_) => {
                return Err(NsqError::protocol("message frame during identify"))
            }
        };
        framed.codec_mut().set_extended(response.extend_support);
        state.store(ConnState::Identified as u8, Ordering::Release);
        debug!(
            address = %address,
            extend_support = response.extend_support,
            max_rdy = response.max_rdy_count,
            "identify negotiated"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(io_loop(
            address.clone(),
            framed,
            command_rx,
            message_tx,
            state.clone(),
            cancel.clone(),
            config.heartbeat_interval,
        ));
        state.store(ConnState::Active as u8, Ordering::Release);
        global_metrics().record_connection_created();
        info!(address = %address, "connection established");

        Ok(Self {
            address: address.clone(),
            state,
            features: NegotiatedFeatures {
                max_rdy: response.max_rdy_count,
                extend_support: response.extend_support,
            },
            command_tx,
            messages: Mutex::new(Some(message_rx)),
            credit: Arc::new(AtomicI64::new(0)),
            cancel,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active && !self.command_tx.is_closed()
    }

    pub fn features(&self) -> NegotiatedFeatures {
        self.features
    }

    /// In-flight credit counter shared with the delivery loop.
    pub(crate) fn credit(&self) -> Arc<AtomicI64> {
        self.credit.clone()
    }

    /// Send a command and wait for the broker's reply.
    pub async fn command(&self, command: Command) -> Result<Bytes, NsqError> {
        debug_assert!(command.expects_response());
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send((command, Some(tx)))
            .map_err(|_| NsqError::connection(format!("connection to {} closed", self.address)))?;
        rx.await
            .map_err(|_| NsqError::connection(format!("connection to {} closed", self.address)))?
    }

    /// Send a command with no reply (RDY, FIN, REQ, NOP).
    pub fn send(&self, command: Command) -> Result<(), NsqError> {
        debug_assert!(!command.expects_response());
        self.command_tx
            .send((command, None))
            .map_err(|_| NsqError::connection(format!("connection to {} closed", self.address)))
    }

    /// Take the inbound message stream. Yields once; the consumer's delivery
    /// loop is the single reader.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<MessageFrame>> {
        self.messages.lock().take()
    }

    /// Drive the connection to Closing; the IO loop sends a final CLS and
    /// settles in Closed. Safe to call repeatedly and from any task.
    pub fn close(&self) {
        let current = self.state();
        if current == ConnState::Closing || current == ConnState::Closed {
            return;
        }
        self.state.store(ConnState::Closing as u8, Ordering::Release);
        self.cancel.cancel();
    }
}

async fn io_loop(
    address: Address,
    mut framed: Framed<TcpStream, NsqCodec>,
    mut command_rx: mpsc::UnboundedReceiver<Outbound>,
    message_tx: mpsc::UnboundedSender<MessageFrame>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) {
    let mut pending: VecDeque<Completion> = VecDeque::new();
    let mut last_activity = Instant::now();
    // A broker silent for two heartbeat intervals is considered gone.
    let liveness_bound = heartbeat_interval * 2;
    let mut liveness = tokio::time::interval(heartbeat_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = framed.send(Command::Close).await;
                debug!(address = %address, "connection closing");
                break;
            }
            outbound = command_rx.recv() => {
                match outbound {
                    Some((command, completion)) => {
                        let name = command.name();
                        if let Err(e) = framed.send(command).await {
                            error!(address = %address, command = name, error = %e, "command write failed");
                            if let Some(completion) = completion {
                                let _ = completion.send(Err(NsqError::connection(format!(
                                    "write to {} failed: {}", address, e
                                ))));
                            }
                            break;
                        }
                        if let Some(completion) = completion {
                            pending.push_back(completion);
                        }
                    }
                    None => {
                        debug!(address = %address, "command channel closed");
                        break;
                    }
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(Frame::Response(data))) => {
                        last_activity = Instant::now();
                        if &data[..] == HEARTBEAT {
                            // Answered in-band; heartbeats never touch credit.
                            if framed.send(Command::Nop).await.is_err() {
                                break;
                            }
                        } else if let Some(completion) = pending.pop_front() {
                            let _ = completion.send(Ok(data));
                        } else {
                            debug!(address = %address, "response with no pending command");
                        }
                    }
                    Some(Ok(Frame::Error(message))) => {
                        last_activity = Instant::now();
                        if let Some(completion) = pending.pop_front() {
                            let _ = completion.send(Err(NsqError::protocol(message)));
                        } else {
                            // Unsolicited protocol error is fatal for the session.
                            error!(address = %address, error = %message, "broker error frame");
                            break;
                        }
                    }
                    Some(Ok(Frame::Message(frame))) => {
                        last_activity = Instant::now();
                        if message_tx.send(frame).is_err() {
                            debug!(address = %address, "message receiver dropped");
                        }
                    }
                    Some(Err(e)) => {
                        error!(address = %address, error = %e, "frame decode failed");
                        global_metrics().record_connection_error();
                        break;
                    }
                    None => {
                        debug!(address = %address, "broker closed the connection");
                        break;
                    }
                }
            }
            _ = liveness.tick() => {
                if last_activity.elapsed() > liveness_bound {
                    warn!(
                        address = %address,
                        silent_for = ?last_activity.elapsed(),
                        "missed heartbeats, dropping connection"
                    );
                    global_metrics().record_connection_error();
                    break;
                }
            }
        }
    }

    state.store(ConnState::Closed as u8, Ordering::Release);
    while let Some(completion) = pending.pop_front() {
        let _ = completion.send(Err(NsqError::connection(format!(
            "connection to {} closed",
            address
        ))));
    }
    info!(address = %address, "connection closed");
}

struct EndpointPool {
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<(Connection, OwnedSemaphorePermit)>>,
}

impl EndpointPool {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
        }
    }
}

/// A checked-out connection. Return it with [`ConnectionPool::release`];
/// dropping it instead closes the connection and frees its slot.
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }
}

/// Bounded pool of live connections per broker endpoint.
///
/// At most `connection_pool_size` live connections (idle plus checked-out)
/// exist per endpoint. `acquire` waits up to `query_timeout` for a free slot
/// and then fails with `PoolExhausted`; this bounded-wait policy matches the
/// acquire suspension bound of the synchronous operations.
pub struct ConnectionPool {
    endpoints: DashMap<Address, Arc<EndpointPool>>,
    config: Arc<NsqConfig>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: Arc<NsqConfig>) -> Self {
        Self {
            endpoints: DashMap::new(),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a connection to `address`, reusing an idle one when
    /// possible.
    pub async fn acquire(&self, address: &Address) -> Result<PooledConnection, NsqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NsqError::Closed);
        }
        let endpoint = self
            .endpoints
            .entry(address.clone())
            .or_insert_with(|| Arc::new(EndpointPool::new(self.config.connection_pool_size)))
            .clone();

        // Idle connections carry their slot permit with them; broken ones
        // free the slot on drop.
        loop {
            let candidate = endpoint.idle.lock().pop();
            match candidate {
                Some((conn, permit)) => {
                    if conn.is_active() {
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            permit: Some(permit),
                        });
                    }
                    conn.close();
                }
                None => break,
            }
        }

        let wait = self.config.query_timeout;
        let permit = timeout(wait, endpoint.slots.clone().acquire_owned())
            .await
            .map_err(|_| NsqError::PoolExhausted {
                endpoint: address.to_string(),
                waited_ms: wait.as_millis() as u64,
            })?
            .map_err(|_| NsqError::Closed)?;

        let conn = Connection::open(address, &self.config).await?;
        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
        })
    }

    /// Return a connection to the idle set, or close and evict it if the
    /// session broke while checked out.
    pub fn release(&self, mut pooled: PooledConnection) {
        let conn = pooled.conn.take().expect("connection present until release");
        let permit = pooled.permit.take().expect("permit present until release");
        if self.closed.load(Ordering::Acquire) || !conn.is_active() {
            conn.close();
            return;
        }
        if let Some(endpoint) = self.endpoints.get(conn.address()) {
            endpoint.idle.lock().push((conn, permit));
        } else {
            conn.close();
        }
    }

    /// Close every idle connection and refuse further acquires. Checked-out
    /// connections are closed as they come back through `release`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.endpoints.iter() {
            let mut idle = entry.value().idle.lock();
            for (conn, _permit) in idle.drain(..) {
                conn.close();
            }
        }
        info!("connection pool closed");
    }

    /// Live connections (idle plus checked out) for an endpoint.
    pub fn live_connections(&self, address: &Address) -> usize {
        match self.endpoints.get(address) {
            Some(endpoint) => {
                self.config.connection_pool_size - endpoint.slots.available_permits()
            }
            None => 0,
        }
    }
}
