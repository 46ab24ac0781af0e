//! # NSQ Client Library
//!
//! An async Rust client for clustered, partitioned NSQ-style message
//! queues.
//!
//! ## Features
//!
//! - **Dynamic discovery**: lookup-service resolution with per-topic
//!   caching and a pluggable remote configuration agent
//! - **Deterministic routing**: sharding-id based partition selection for
//!   order-preserving publish
//! - **Feature negotiation**: identify handshake with tag-based selective
//!   delivery (`extend_support`)
//! - **Flow control**: credit-based delivery (RDY) with at-least-once
//!   ack/timeout/requeue semantics
//! - **Connection pooling**: bounded per-endpoint pools with reuse and
//!   eviction
//!
//! ## Quick Start
//!
//! ### Producer Example
//!
//! ```rust,no_run
//! use nsq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = NsqConfig::builder()
//!         .user_specified_lookup(true)
//!         .lookup_addresses(vec!["lookup-1:4161"])
//!         .build()?;
//!     let producer = Producer::builder().config(config).build()?;
//!
//!     let topic = Topic::new("orders");
//!     let message = Message::new(topic, "hello").with_sharding(42);
//!     producer.publish(message).await?;
//!
//!     producer.close();
//!     Ok(())
//! }
//! ```
//!
//! ### Consumer Example
//!
//! ```rust,no_run
//! use nsq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = NsqConfig::builder()
//!         .channel("my-channel")
//!         .user_specified_lookup(true)
//!         .lookup_addresses(vec!["lookup-1:4161"])
//!         .build()?;
//!     let consumer = Consumer::builder()
//!         .config(config)
//!         .handler(|message: &NsqMessage| -> HandlerResult {
//!             println!("received: {}", message.readable_body());
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     consumer.subscribe(Topic::new("orders"))?;
//!     consumer.start().await?;
//!     // ... run until shutdown ...
//!     consumer.close().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod entity;
pub mod error;
pub mod lookup;
pub mod metrics;
pub mod producer;
pub mod protocol;

pub use config::{Compression, DesiredTag, NsqConfig, NsqConfigBuilder, RetryPolicy};
pub use connection::{ConnState, Connection, ConnectionPool, NegotiatedFeatures, PooledConnection};
pub use consumer::{Consumer, ConsumerBuilder, MessageHandler};
pub use entity::{Address, Message, MessageId, NsqMessage, Topic};
pub use error::NsqError;
pub use lookup::{AccessType, ConfigAgent, LookupResolver};
pub use metrics::{global_metrics, ClientMetrics, MetricsSnapshot};
pub use producer::{Producer, ProducerBuilder};

/// Client library result type
pub type Result<T> = std::result::Result<T, NsqError>;

/// Result type expected from message handlers
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
