//! Configuration types for the NSQ client

use crate::error::NsqError;
use serde::Serialize;
use std::time::Duration;

/// Maximum byte length of a [`DesiredTag`]. The tag travels in a
/// length-prefixed extension header, so the bound is enforced at
/// construction time rather than at publish time.
pub const MAX_TAG_LEN: usize = 100;

/// Compression modes negotiated during the identify handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Deflate,
    Snappy,
}

/// A validated message tag used for server-side selective delivery.
///
/// A consumer registering a tag only receives messages published with a
/// matching tag; untagged consumers receive untagged messages. Construction
/// fails for tags containing whitespace or longer than [`MAX_TAG_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DesiredTag(String);

impl DesiredTag {
    pub fn new<S: Into<String>>(tag: S) -> Result<Self, NsqError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(NsqError::validation("tag must not be empty"));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(NsqError::validation(format!(
                "tag exceeds {} bytes: {} bytes",
                MAX_TAG_LEN,
                tag.len()
            )));
        }
        if tag.chars().any(char::is_whitespace) {
            return Err(NsqError::validation("tag must not contain whitespace"));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DesiredTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retry policy for transparent reconnect/republish attempts.
///
/// Backoff grows exponentially from `initial_backoff`, capped at
/// `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff duration before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let backoff = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(backoff as u64).min(self.max_backoff)
    }
}

/// Immutable client configuration, shared by producers and consumers.
///
/// Built via [`NsqConfigBuilder`]; invalid combinations fail at build time.
#[derive(Debug, Clone)]
pub struct NsqConfig {
    pub(crate) ordered: bool,
    pub(crate) user_specified_lookup: bool,
    pub(crate) lookup_addresses: Vec<String>,
    pub(crate) channel: Option<String>,
    pub(crate) connection_pool_size: usize,
    pub(crate) msg_timeout: Duration,
    pub(crate) output_buffer_size: Option<u32>,
    pub(crate) output_buffer_timeout: Option<Duration>,
    pub(crate) query_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) rdy: u32,
    pub(crate) io_concurrency: usize,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) sample_rate: u8,
    pub(crate) deflate_level: u8,
    pub(crate) compression: Compression,
    pub(crate) desired_tag: Option<DesiredTag>,
    pub(crate) extended: bool,
    pub(crate) client_id: Option<String>,
    pub(crate) lookup_cache_ttl: Duration,
    pub(crate) retry: RetryPolicy,
}

impl NsqConfig {
    /// Start building a configuration.
    pub fn builder() -> NsqConfigBuilder {
        NsqConfigBuilder::default()
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn desired_tag(&self) -> Option<&DesiredTag> {
        self.desired_tag.as_ref()
    }

    pub fn rdy(&self) -> u32 {
        self.rdy
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn msg_timeout(&self) -> Duration {
        self.msg_timeout
    }

    /// Whether the identify handshake advertises extension support.
    ///
    /// True as soon as a tag or any extended feature is configured.
    pub fn extend_support(&self) -> bool {
        self.extended || self.desired_tag.is_some()
    }

    /// Build the identify payload advertised to a broker on connect.
    pub fn identify_body(&self) -> IdentifyBody {
        IdentifyBody {
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| "nsq-rust-client".to_string()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            feature_negotiation: true,
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: self.output_buffer_timeout.map(|d| d.as_millis() as u64),
            sample_rate: self.sample_rate,
            deflate: self.compression == Compression::Deflate,
            deflate_level: if self.compression == Compression::Deflate {
                Some(self.deflate_level)
            } else {
                None
            },
            snappy: self.compression == Compression::Snappy,
            msg_timeout: self.msg_timeout.as_millis() as u64,
            extend_support: self.extend_support(),
            desired_tag: self.desired_tag.as_ref().map(|t| t.as_str().to_string()),
        }
    }
}

impl Default for NsqConfig {
    fn default() -> Self {
        NsqConfigBuilder::default()
            .build()
            .expect("default configuration is valid")
    }
}

/// Identify handshake payload, serialized as JSON after the IDENTIFY command.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyBody {
    pub client_id: String,
    pub hostname: String,
    pub feature_negotiation: bool,
    pub heartbeat_interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<u64>,
    pub sample_rate: u8,
    pub deflate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deflate_level: Option<u8>,
    pub snappy: bool,
    pub msg_timeout: u64,
    pub extend_support: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_tag: Option<String>,
}

/// Validating builder for [`NsqConfig`]
#[derive(Debug, Clone)]
pub struct NsqConfigBuilder {
    ordered: bool,
    user_specified_lookup: bool,
    lookup_addresses: Vec<String>,
    channel: Option<String>,
    connection_pool_size: usize,
    msg_timeout: Duration,
    output_buffer_size: Option<u32>,
    output_buffer_timeout: Option<Duration>,
    query_timeout: Duration,
    connect_timeout: Duration,
    rdy: u32,
    io_concurrency: usize,
    heartbeat_interval: Duration,
    sample_rate: u8,
    deflate_level: u8,
    compression: Compression,
    desired_tag: Option<DesiredTag>,
    extended: bool,
    client_id: Option<String>,
    lookup_cache_ttl: Duration,
    retry: RetryPolicy,
}

impl Default for NsqConfigBuilder {
    fn default() -> Self {
        Self {
            ordered: false,
            user_specified_lookup: false,
            lookup_addresses: Vec::new(),
            channel: None,
            connection_pool_size: 10,
            msg_timeout: Duration::from_secs(60),
            output_buffer_size: None,
            output_buffer_timeout: None,
            query_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            rdy: 3,
            io_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            heartbeat_interval: Duration::from_secs(30),
            sample_rate: 0,
            deflate_level: 6,
            compression: Compression::None,
            desired_tag: None,
            extended: false,
            client_id: None,
            lookup_cache_ttl: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl NsqConfigBuilder {
    /// Enable ordered consumption: one connection per partition, one
    /// in-flight message at a time, broker send order preserved.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Pin the lookup addresses instead of discovering them through the
    /// remote configuration service. Requires a non-empty address list at
    /// build time. When left false, any addresses set here are ignored.
    pub fn user_specified_lookup(mut self, enabled: bool) -> Self {
        self.user_specified_lookup = enabled;
        self
    }

    /// Lookup service addresses (`host:port`), effective only together with
    /// [`Self::user_specified_lookup`].
    pub fn lookup_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookup_addresses = addresses.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Consumer group name ("channel"). Required for consumers, ignored by
    /// producers.
    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Maximum live connections per broker endpoint.
    pub fn connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    /// Time a delivered message may stay unacknowledged before the broker
    /// requeues it.
    pub fn msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = timeout;
        self
    }

    pub fn output_buffer_size(mut self, size: u32) -> Self {
        self.output_buffer_size = Some(size);
        self
    }

    pub fn output_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.output_buffer_timeout = Some(timeout);
        self
    }

    /// Bound on synchronous operations: publish replies and pool acquire.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Maximum in-flight credit per connection. Forced to 1 in ordered mode.
    pub fn rdy(mut self, rdy: u32) -> Self {
        self.rdy = rdy;
        self
    }

    /// Size of the handler dispatch pool.
    pub fn io_concurrency(mut self, permits: usize) -> Self {
        self.io_concurrency = permits;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Deliver only a percentage of messages (0 disables sampling).
    pub fn sample_rate(mut self, rate: u8) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn deflate_level(mut self, level: u8) -> Self {
        self.deflate_level = level;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Restrict delivery to messages carrying this tag.
    pub fn desired_tag(mut self, tag: DesiredTag) -> Self {
        self.desired_tag = Some(tag);
        self
    }

    /// Advertise extension support without registering a tag, e.g. to
    /// observe tags on a mixed-mode subscription.
    pub fn extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Staleness window for cached lookup results.
    pub fn lookup_cache_ttl(mut self, ttl: Duration) -> Self {
        self.lookup_cache_ttl = ttl;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<NsqConfig, NsqError> {
        if self.user_specified_lookup && self.lookup_addresses.is_empty() {
            return Err(NsqError::validation(
                "user-specified lookup requires at least one lookup address",
            ));
        }
        if self.connection_pool_size == 0 {
            return Err(NsqError::validation("connection pool size must be positive"));
        }
        if self.rdy == 0 {
            return Err(NsqError::validation("rdy must be positive"));
        }
        if self.io_concurrency == 0 {
            return Err(NsqError::validation("io concurrency must be positive"));
        }
        if self.sample_rate > 99 {
            return Err(NsqError::validation("sample rate must be within 0..=99"));
        }
        if self.compression == Compression::Deflate
            && !(1..=9).contains(&self.deflate_level)
        {
            return Err(NsqError::validation("deflate level must be within 1..=9"));
        }
        let lookup_addresses = if self.user_specified_lookup {
            self.lookup_addresses
        } else {
            // Discovery goes through the config agent; explicitly set
            // addresses are ignored by contract.
            Vec::new()
        };
        Ok(NsqConfig {
            ordered: self.ordered,
            user_specified_lookup: self.user_specified_lookup,
            lookup_addresses,
            channel: self.channel,
            connection_pool_size: self.connection_pool_size,
            msg_timeout: self.msg_timeout,
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: self.output_buffer_timeout,
            query_timeout: self.query_timeout,
            connect_timeout: self.connect_timeout,
            rdy: self.rdy,
            io_concurrency: self.io_concurrency,
            heartbeat_interval: self.heartbeat_interval,
            sample_rate: self.sample_rate,
            deflate_level: self.deflate_level,
            compression: self.compression,
            desired_tag: self.desired_tag,
            extended: self.extended,
            client_id: self.client_id,
            lookup_cache_ttl: self.lookup_cache_ttl,
            retry: self.retry,
        })
    }
}
