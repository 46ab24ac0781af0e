//! Producer client for publishing messages

use crate::config::NsqConfig;
use crate::connection::ConnectionPool;
use crate::entity::{Address, Message, Topic};
use crate::error::NsqError;
use crate::lookup::{AccessType, ConfigAgent, LookupResolver};
use crate::metrics::global_metrics;
use crate::protocol::{Command, OK};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

/// Publishes messages with deterministic partition routing.
///
/// Messages carrying a sharding id always land on
/// `sharding_id mod partition_count`; unsharded messages round-robin over
/// the write-access partition set.
pub struct Producer {
    config: Arc<NsqConfig>,
    resolver: Arc<LookupResolver>,
    pool: Arc<ConnectionPool>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
}

impl Producer {
    /// Create a producer. `agent` is required unless the configuration pins
    /// lookup addresses.
    pub fn new(config: NsqConfig, agent: Option<Arc<ConfigAgent>>) -> Result<Self, NsqError> {
        let resolver = Arc::new(LookupResolver::for_config(&config, agent)?);
        let config = Arc::new(config);
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        Ok(Self {
            config,
            resolver,
            pool,
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::default()
    }

    /// Publish one message and wait for the broker's acknowledgment.
    ///
    /// Transient transport failures are retried with backoff against a
    /// freshly resolved partition set; validation and timeout failures
    /// surface immediately.
    pub async fn publish(&self, message: Message) -> Result<(), NsqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NsqError::Closed);
        }
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.try_publish(&message, attempt > 0).await {
                Ok(()) => {
                    global_metrics().record_publish(message.body().len() as u64);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let backoff = retry.backoff(attempt);
                    warn!(
                        topic = %message.topic(),
                        attempt,
                        backoff = ?backoff,
                        error = %e,
                        "publish attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    global_metrics().record_publish_error();
                    return Err(e);
                }
            }
        }
    }

    /// Publish a UTF-8 payload.
    pub async fn publish_text<S: Into<String>>(&self, topic: Topic, body: S) -> Result<(), NsqError> {
        self.publish(Message::new(topic, body.into())).await
    }

    async fn try_publish(&self, message: &Message, force_refresh: bool) -> Result<(), NsqError> {
        let topic_name = message.topic().name();
        let addresses = if force_refresh {
            self.resolver.refresh(topic_name, AccessType::Write).await?
        } else {
            self.resolver.lookup(topic_name, AccessType::Write).await?
        };
        if addresses.is_empty() {
            return Err(NsqError::lookup(format!(
                "no write partitions for topic {}",
                topic_name
            )));
        }
        let address = self.select_partition(&addresses, message)?;

        let conn = self.pool.acquire(address).await?;
        if message.tag.is_some() && !conn.features().extend_support {
            self.pool.release(conn);
            return Err(NsqError::feature_unsupported(format!(
                "broker {} did not negotiate tag support",
                address
            )));
        }

        let command = Command::Publish {
            topic: topic_name.to_string(),
            partition: address.partition,
            body: message.body().clone(),
            tag: message.tag.as_ref().map(|t| t.as_str().to_string()),
        };
        let reply = timeout(self.config.query_timeout, conn.command(command)).await;
        let outcome = match reply {
            Err(_) => {
                // The reply slot stays pending on the wire; the session is
                // no longer safe to reuse.
                conn.close();
                Err(NsqError::PublishTimeout {
                    timeout_ms: self.config.query_timeout.as_millis() as u64,
                })
            }
            Ok(Ok(data)) if &data[..] == OK => Ok(()),
            Ok(Ok(data)) => Err(NsqError::protocol(format!(
                "unexpected publish reply: {}",
                String::from_utf8_lossy(&data)
            ))),
            Ok(Err(e)) => Err(e),
        };
        self.pool.release(conn);
        outcome
    }

    fn select_partition<'a>(
        &self,
        addresses: &'a [Address],
        message: &Message,
    ) -> Result<&'a Address, NsqError> {
        if let Some(pinned) = message.topic().partition() {
            return addresses
                .iter()
                .find(|a| a.partition == pinned)
                .ok_or_else(|| {
                    NsqError::lookup(format!(
                        "partition {} of topic {} is not available",
                        pinned,
                        message.topic().name()
                    ))
                });
        }
        let index = match message.effective_sharding() {
            Some(sharding_id) => sharding_id.rem_euclid(addresses.len() as i64) as usize,
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % addresses.len(),
        };
        Ok(&addresses[index])
    }

    /// Drain the connection pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        info!("producer closed");
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder for [`Producer`]
#[derive(Default)]
pub struct ProducerBuilder {
    config: Option<NsqConfig>,
    agent: Option<Arc<ConfigAgent>>,
}

impl ProducerBuilder {
    pub fn config(mut self, config: NsqConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject the discovery agent used when lookup addresses are not pinned.
    pub fn config_agent(mut self, agent: Arc<ConfigAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn build(self) -> Result<Producer, NsqError> {
        let config = self.config.unwrap_or_default();
        Producer::new(config, self.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned_producer() -> Producer {
        let config = NsqConfig::builder()
            .user_specified_lookup(true)
            .lookup_addresses(vec!["lookup-1:4161"])
            .build()
            .unwrap();
        Producer::new(config, None).unwrap()
    }

    fn partitions(count: i32) -> Vec<Address> {
        (0..count)
            .map(|p| Address::new("10.0.0.1", 4150 + p as u16, "1.0", "orders", p, false))
            .collect()
    }

    #[test]
    fn test_sharding_is_deterministic() {
        let producer = pinned_producer();
        let addresses = partitions(2);
        let msg = Message::new(Topic::new("orders"), "a").with_sharding(7);
        let first = producer.select_partition(&addresses, &msg).unwrap();
        let second = producer.select_partition(&addresses, &msg).unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(first.partition, 7 % 2);
    }

    #[test]
    fn test_distinct_shards_map_to_distinct_partitions() {
        let producer = pinned_producer();
        let addresses = partitions(2);
        let s0 = Message::new(Topic::new("orders"), "a").with_sharding(0);
        let s1 = Message::new(Topic::new("orders"), "b").with_sharding(1);
        let p0 = producer.select_partition(&addresses, &s0).unwrap().partition;
        let p1 = producer.select_partition(&addresses, &s1).unwrap().partition;
        assert_ne!(p0, p1);
    }

    #[test]
    fn test_negative_sharding_id_stays_in_range() {
        let producer = pinned_producer();
        let addresses = partitions(3);
        let msg = Message::new(Topic::new("orders"), "a").with_sharding(-5);
        let selected = producer.select_partition(&addresses, &msg).unwrap();
        assert!((0..3).contains(&selected.partition));
        // -5 mod 3 without sign surprises
        assert_eq!(selected.partition, 1);
    }

    #[test]
    fn test_round_robin_cycles_without_sharding() {
        let producer = pinned_producer();
        let addresses = partitions(3);
        let msg = Message::new(Topic::new("orders"), "a");
        let picks: Vec<i32> = (0..6)
            .map(|_| producer.select_partition(&addresses, &msg).unwrap().partition)
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_pinned_partition_selection() {
        let producer = pinned_producer();
        let addresses = partitions(2);
        let msg = Message::new(Topic::new("orders").with_partition(1), "a");
        assert_eq!(
            producer.select_partition(&addresses, &msg).unwrap().partition,
            1
        );
        let missing = Message::new(Topic::new("orders").with_partition(9), "a");
        assert!(producer.select_partition(&addresses, &missing).is_err());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let producer = pinned_producer();
        producer.close();
        let result = producer
            .publish(Message::new(Topic::new("orders"), "a"))
            .await;
        assert!(matches!(result, Err(NsqError::Closed)));
    }
}
