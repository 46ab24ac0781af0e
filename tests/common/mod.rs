//! In-process test doubles: a lookup service over HTTP and a broker
//! partition speaking the wire protocol.
//!
//! The broker double implements just enough of the contract to drive the
//! client: identify echo with configurable extension support, credit-bounded
//! delivery, FIN/REQ, tag-aware channel dispatch, and in-flight timeout
//! requeue.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_MESSAGE: i32 = 2;
const EXT_VERSION: u8 = 1;
const TAG_KEY: &str = "##client_dispatch_tag";

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

fn response_frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&((4 + data.len()) as u32).to_be_bytes());
    out.extend_from_slice(&FRAME_TYPE_RESPONSE.to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn message_frame(extended: bool, msg: &Stored) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&now_nanos().to_be_bytes());
    data.extend_from_slice(&msg.attempts.to_be_bytes());
    data.extend_from_slice(&msg.id);
    if extended {
        let header = match &msg.tag {
            Some(tag) => format!(r#"{{"{}":"{}"}}"#, TAG_KEY, tag),
            None => "{}".to_string(),
        };
        data.push(EXT_VERSION);
        data.extend_from_slice(&(header.len() as u16).to_be_bytes());
        data.extend_from_slice(header.as_bytes());
    }
    data.extend_from_slice(&msg.body);

    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&((4 + data.len()) as u32).to_be_bytes());
    out.extend_from_slice(&FRAME_TYPE_MESSAGE.to_be_bytes());
    out.extend_from_slice(&data);
    out
}

#[derive(Clone)]
struct Stored {
    id: [u8; 16],
    body: Vec<u8>,
    tag: Option<String>,
    attempts: u16,
}

struct Subscriber {
    tag: Option<String>,
    credit: i64,
    msg_timeout: Duration,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct InFlight {
    msg: Stored,
    deadline: Instant,
    conn_id: u64,
}

struct NsqdState {
    extend_support: bool,
    silent_pub: bool,
    queue: Mutex<VecDeque<Stored>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    in_flight: Mutex<Vec<InFlight>>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_id: AtomicU64,
    next_conn: AtomicU64,
    open_conns: AtomicUsize,
    max_in_flight_per_sub: AtomicUsize,
    published: AtomicUsize,
}

/// One mock broker partition.
pub struct MockNsqd {
    pub addr: SocketAddr,
    pub partition: i32,
    state: Arc<NsqdState>,
}

impl MockNsqd {
    pub async fn start(partition: i32, extend_support: bool) -> Self {
        Self::start_with(partition, extend_support, false).await
    }

    /// `silent_pub` suppresses PUB replies to provoke client-side timeouts.
    pub async fn start_with(partition: i32, extend_support: bool, silent_pub: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(NsqdState {
            extend_support,
            silent_pub,
            queue: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_conn: AtomicU64::new(1),
            open_conns: AtomicUsize::new(0),
            max_in_flight_per_sub: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(handle_connection(state, socket));
            }
        });

        let pump_state = state.clone();
        tokio::spawn(delivery_pump(pump_state));

        Self {
            addr,
            partition,
            state,
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_conns.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight messages observed for any
    /// single subscriber.
    pub fn max_in_flight_per_sub(&self) -> usize {
        self.state.max_in_flight_per_sub.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> usize {
        self.state.published.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.state.queue.lock().unwrap().len()
    }

    /// Forcefully drop every live connection, requeueing in-flight
    /// deliveries.
    pub fn kill_connections(&self) {
        let mut conns = self.state.conns.lock().unwrap();
        for (_, tx) in conns.iter() {
            // Empty buffer is the writer's shutdown signal.
            let _ = tx.send(Vec::new());
        }
        conns.clear();
        let ids: Vec<u64> = self
            .state
            .subscribers
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        for conn_id in ids {
            drop_subscriber(&self.state, conn_id);
        }
    }
}

// Lock order everywhere: queue, then subscribers, then in_flight.
fn drop_subscriber(state: &NsqdState, conn_id: u64) {
    let mut queue = state.queue.lock().unwrap();
    state.subscribers.lock().unwrap().remove(&conn_id);
    let mut in_flight = state.in_flight.lock().unwrap();
    let mut index = 0;
    while index < in_flight.len() {
        if in_flight[index].conn_id == conn_id {
            let entry = in_flight.swap_remove(index);
            queue.push_front(entry.msg);
        } else {
            index += 1;
        }
    }
}

async fn handle_connection(state: Arc<NsqdState>, socket: tokio::net::TcpStream) {
    let conn_id = state.next_conn.fetch_add(1, Ordering::SeqCst);
    state.open_conns.fetch_add(1, Ordering::SeqCst);
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.conns.lock().unwrap().insert(conn_id, tx.clone());
    tokio::spawn(connection_writer(write_half, rx));

    let result = connection_reader(&state, conn_id, read_half, tx).await;
    if let Err(e) = result {
        let _ = e; // disconnects are expected in tests
    }
    state.conns.lock().unwrap().remove(&conn_id);
    drop_subscriber(&state, conn_id);
    state.open_conns.fetch_sub(1, Ordering::SeqCst);
}

async fn connection_writer(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(buf) = rx.recv().await {
        if buf.is_empty() {
            let _ = write_half.shutdown().await;
            return;
        }
        if write_half.write_all(&buf).await.is_err() {
            return;
        }
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn read_sized_body(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn connection_reader(
    state: &Arc<NsqdState>,
    conn_id: u64,
    read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(read_half);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    let mut msg_timeout = Duration::from_secs(60);

    loop {
        let line = read_line(&mut reader).await?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("IDENTIFY") => {
                let body = read_sized_body(&mut reader).await?;
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
                    if let Some(ms) = value.get("msg_timeout").and_then(|v| v.as_u64()) {
                        msg_timeout = Duration::from_millis(ms);
                    }
                }
                let payload = format!(
                    r#"{{"max_rdy_count":2500,"extend_support":{}}}"#,
                    state.extend_support
                );
                let _ = tx.send(response_frame(payload.as_bytes()));
            }
            Some("SUB") | Some("SUB_ORDERED") => {
                let tag = tokens.get(4).map(|t| t.to_string());
                state.subscribers.lock().unwrap().insert(
                    conn_id,
                    Subscriber {
                        tag,
                        credit: 0,
                        msg_timeout,
                        tx: tx.clone(),
                    },
                );
                let _ = tx.send(response_frame(b"OK"));
            }
            Some("RDY") => {
                let count: i64 = tokens.get(1).and_then(|t| t.parse().ok()).unwrap_or(0);
                if let Some(sub) = state.subscribers.lock().unwrap().get_mut(&conn_id) {
                    sub.credit = count;
                }
            }
            Some("PUB") => {
                let body = read_sized_body(&mut reader).await?;
                store_message(state, body, None);
                if !state.silent_pub {
                    let _ = tx.send(response_frame(b"OK"));
                }
            }
            Some("PUB_EXT") => {
                let body = read_sized_body(&mut reader).await?;
                let (tag, payload) = split_ext_body(&body);
                store_message(state, payload, tag);
                if !state.silent_pub {
                    let _ = tx.send(response_frame(b"OK"));
                }
            }
            Some("FIN") => {
                if let Some(id) = parse_id(tokens.get(1)) {
                    settle_in_flight(state, conn_id, id, Settle::Finish);
                }
            }
            Some("REQ") => {
                if let Some(id) = parse_id(tokens.get(1)) {
                    settle_in_flight(state, conn_id, id, Settle::Requeue);
                }
            }
            Some("NOP") => {}
            Some("CLS") => {
                let _ = tx.send(response_frame(b"CLOSE_WAIT"));
                return Ok(());
            }
            _ => {}
        }
    }
}

fn parse_id(token: Option<&&str>) -> Option<[u8; 16]> {
    let token = token?;
    let bytes = token.as_bytes();
    if bytes.len() != 16 {
        return None;
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(bytes);
    Some(id)
}

fn split_ext_body(body: &[u8]) -> (Option<String>, Vec<u8>) {
    if body.len() < 3 || body[0] != EXT_VERSION {
        return (None, body.to_vec());
    }
    let header_len = u16::from_be_bytes([body[1], body[2]]) as usize;
    if body.len() < 3 + header_len {
        return (None, body.to_vec());
    }
    let header = &body[3..3 + header_len];
    let payload = body[3 + header_len..].to_vec();
    let tag = serde_json::from_slice::<serde_json::Value>(header)
        .ok()
        .and_then(|v| v.get(TAG_KEY).and_then(|t| t.as_str()).map(String::from));
    (tag, payload)
}

fn store_message(state: &Arc<NsqdState>, body: Vec<u8>, tag: Option<String>) {
    let seq = state.next_id.fetch_add(1, Ordering::SeqCst);
    let rendered = format!("{:016x}", seq);
    let mut id = [0u8; 16];
    id.copy_from_slice(rendered.as_bytes());
    state.queue.lock().unwrap().push_back(Stored {
        id,
        body,
        tag,
        attempts: 0,
    });
    state.published.fetch_add(1, Ordering::SeqCst);
}

enum Settle {
    Finish,
    Requeue,
}

fn settle_in_flight(state: &Arc<NsqdState>, conn_id: u64, id: [u8; 16], settle: Settle) {
    let mut queue = state.queue.lock().unwrap();
    let mut subscribers = state.subscribers.lock().unwrap();
    let mut in_flight = state.in_flight.lock().unwrap();
    let position = in_flight
        .iter()
        .position(|entry| entry.conn_id == conn_id && entry.msg.id == id);
    let Some(entry) = position.map(|index| in_flight.swap_remove(index)) else {
        return;
    };
    if let Settle::Requeue = settle {
        queue.push_front(entry.msg);
    }
    if let Some(sub) = subscribers.get_mut(&conn_id) {
        sub.credit += 1;
    }
}

async fn delivery_pump(state: Arc<NsqdState>) {
    let mut last_heartbeat = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Requeue expired in-flight deliveries.
        {
            let now = Instant::now();
            let mut queue = state.queue.lock().unwrap();
            let mut subscribers = state.subscribers.lock().unwrap();
            let mut in_flight = state.in_flight.lock().unwrap();
            let mut index = 0;
            while index < in_flight.len() {
                if in_flight[index].deadline <= now {
                    let entry = in_flight.swap_remove(index);
                    if let Some(sub) = subscribers.get_mut(&entry.conn_id) {
                        sub.credit += 1;
                    }
                    queue.push_front(entry.msg);
                } else {
                    index += 1;
                }
            }
        }

        // Deliver queued messages to eligible subscribers in queue order.
        {
            let now = Instant::now();
            let mut queue = state.queue.lock().unwrap();
            let mut subscribers = state.subscribers.lock().unwrap();
            let mut in_flight = state.in_flight.lock().unwrap();
            let mut index = 0;
            while index < queue.len() {
                let eligible = subscribers
                    .iter_mut()
                    .find(|(_, sub)| sub.credit > 0 && sub.tag == queue[index].tag);
                match eligible {
                    Some((&conn_id, sub)) => {
                        let mut msg = queue.remove(index).unwrap();
                        msg.attempts = msg.attempts.saturating_add(1);
                        let _ = sub.tx.send(message_frame(state.extend_support, &msg));
                        sub.credit -= 1;
                        in_flight.push(InFlight {
                            msg,
                            deadline: now + sub.msg_timeout,
                            conn_id,
                        });
                        let per_sub = in_flight
                            .iter()
                            .filter(|entry| entry.conn_id == conn_id)
                            .count();
                        state
                            .max_in_flight_per_sub
                            .fetch_max(per_sub, Ordering::SeqCst);
                    }
                    None => index += 1,
                }
            }
        }

        // Keep client liveness checks fed. Only subscribed connections are
        // heartbeated so the handshake read never races a heartbeat frame.
        if last_heartbeat.elapsed() >= Duration::from_secs(1) {
            last_heartbeat = Instant::now();
            let subscribers = state.subscribers.lock().unwrap();
            for sub in subscribers.values() {
                let _ = sub.tx.send(response_frame(b"_heartbeat_"));
            }
        }
    }
}

/// One registered topic on the mock lookup service.
struct TopicReg {
    partitions: Vec<(String, u16, i32)>,
    ordered: bool,
}

/// Minimal lookup service answering `GET /lookup?topic=<t>&access=r|w`.
pub struct MockLookupd {
    pub addr: SocketAddr,
    topics: Arc<Mutex<HashMap<String, TopicReg>>>,
}

impl MockLookupd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let topics: Arc<Mutex<HashMap<String, TopicReg>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_topics = topics.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let topics = accept_topics.clone();
                tokio::spawn(async move {
                    let _ = serve_lookup(topics, socket).await;
                });
            }
        });

        Self { addr, topics }
    }

    pub fn base_address(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn register_topic(&self, name: &str, nsqds: &[&MockNsqd], ordered: bool) {
        let partitions = nsqds
            .iter()
            .map(|n| ("127.0.0.1".to_string(), n.addr.port(), n.partition))
            .collect();
        self.topics.lock().unwrap().insert(
            name.to_string(),
            TopicReg {
                partitions,
                ordered,
            },
        );
    }
}

async fn serve_lookup(
    topics: Arc<Mutex<HashMap<String, TopicReg>>>,
    mut socket: tokio::net::TcpStream,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let request = String::from_utf8_lossy(&buf);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let topic = path
        .split('?')
        .nth(1)
        .and_then(|query| {
            query
                .split('&')
                .find(|pair| pair.starts_with("topic="))
                .map(|pair| pair.trim_start_matches("topic=").to_string())
        })
        .unwrap_or_default();

    let body = {
        let topics = topics.lock().unwrap();
        match topics.get(&topic) {
            Some(reg) => {
                let partitions: Vec<String> = reg
                    .partitions
                    .iter()
                    .map(|(host, port, partition)| {
                        format!(
                            r#""{}":{{"broadcast_address":"{}","tcp_port":{},"version":"1.0"}}"#,
                            partition, host, port
                        )
                    })
                    .collect();
                format!(
                    r#"{{"partitions":{{{}}},"meta":{{"ordered":{}}}}}"#,
                    partitions.join(","),
                    reg.ordered
                )
            }
            None => r#"{"partitions":{}}"#.to_string(),
        }
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Minimal remote configuration service answering `GET /lookupd/urls`.
pub struct MockConfigServer {
    pub addr: SocketAddr,
}

impl MockConfigServer {
    pub async fn start(lookup_urls: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = format!(
            r#"{{"urls":[{}]}}"#,
            lookup_urls
                .iter()
                .map(|u| format!(r#""{}""#, u))
                .collect::<Vec<_>>()
                .join(",")
        );
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 512];
                    loop {
                        let Ok(n) = socket.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Self { addr }
    }

    pub fn base_address(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

/// Poll `predicate` until it holds or `deadline` elapses.
pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
