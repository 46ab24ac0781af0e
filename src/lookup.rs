//! Broker discovery: remote configuration agent and topic lookup
//!
//! `ConfigAgent` resolves the lookup-service base URLs themselves from the
//! remote configuration service. `LookupResolver` turns a topic name into
//! the current set of partition endpoints, with a time-bounded cache that is
//! swapped copy-on-write so readers never observe a partial partition set.

use crate::config::NsqConfig;
use crate::entity::Address;
use crate::error::NsqError;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Read or write intent of a lookup query, `access=r|w` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
}

impl AccessType {
    fn as_query(&self) -> &'static str {
        match self {
            AccessType::Read => "r",
            AccessType::Write => "w",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigUrlsResponse {
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Default)]
struct AgentState {
    remotes: Vec<String>,
    env: Option<String>,
    resolved: Option<Arc<Vec<String>>>,
}

/// Resolves lookup-service base URLs through the remote configuration
/// service.
///
/// Lifecycle is constrained: `set_remotes`/`set_env` are idempotent and only
/// legal before the first successful resolution; afterwards they fail with
/// `ConfigAccess` rather than racing resolution. `release()` drops all
/// cached state and the agent can be configured and resolved again from
/// scratch. Callers inject an `Arc<ConfigAgent>` where discovery is needed.
#[derive(Debug)]
pub struct ConfigAgent {
    http: reqwest::Client,
    state: RwLock<AgentState>,
}

impl ConfigAgent {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("http client builds");
        Self {
            http,
            state: RwLock::new(AgentState::default()),
        }
    }

    /// Set the remote configuration service endpoints. Only legal before the
    /// first resolution.
    pub fn set_remotes<I, S>(&self, remotes: I) -> Result<(), NsqError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write();
        if state.resolved.is_some() {
            return Err(NsqError::config_access(
                "config remotes cannot change after first resolution",
            ));
        }
        state.remotes = remotes.into_iter().map(|s| s.into()).collect();
        Ok(())
    }

    /// Scope resolution to an environment tag. Only legal before the first
    /// resolution.
    pub fn set_env<S: Into<String>>(&self, env: S) -> Result<(), NsqError> {
        let mut state = self.state.write();
        if state.resolved.is_some() {
            return Err(NsqError::config_access(
                "environment cannot change after first resolution",
            ));
        }
        state.env = Some(env.into());
        Ok(())
    }

    /// Current lookup-service base URLs, resolving on first use.
    ///
    /// On remote failure the last-known-good set is served when present;
    /// otherwise the caller gets a `ConfigAccess` error, never a silently
    /// empty set.
    pub async fn lookup_urls(&self) -> Result<Arc<Vec<String>>, NsqError> {
        let (remotes, env) = {
            let state = self.state.read();
            if state.remotes.is_empty() {
                return match &state.resolved {
                    Some(urls) => Ok(urls.clone()),
                    None => Err(NsqError::config_access("no config remotes set")),
                };
            }
            (state.remotes.clone(), state.env.clone())
        };

        match self.fetch_urls(&remotes, env.as_deref()).await {
            Ok(urls) => {
                let urls = Arc::new(urls);
                self.state.write().resolved = Some(urls.clone());
                Ok(urls)
            }
            Err(e) => {
                let state = self.state.read();
                match &state.resolved {
                    Some(urls) => {
                        warn!(error = %e, "config remote unreachable, serving last-known-good lookup urls");
                        Ok(urls.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn fetch_urls(&self, remotes: &[String], env: Option<&str>) -> Result<Vec<String>, NsqError> {
        let mut last_err = None;
        for remote in remotes {
            let base = normalize_base(remote);
            let url = match env {
                Some(env) => format!("{}/lookupd/urls?env={}", base, env),
                None => format!("{}/lookupd/urls", base),
            };
            match self.fetch_one(&url).await {
                Ok(urls) if !urls.is_empty() => {
                    debug!(remote = %remote, count = urls.len(), "resolved lookup urls");
                    return Ok(urls);
                }
                Ok(_) => {
                    last_err = Some(NsqError::config_access(format!(
                        "config remote {} returned no lookup urls",
                        remote
                    )));
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "config remote query failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NsqError::config_access("no config remotes set")))
    }

    async fn fetch_one(&self, url: &str) -> Result<Vec<String>, NsqError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| NsqError::config_access(format!("config remote unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(NsqError::config_access(format!(
                "config remote returned status {}",
                response.status()
            )));
        }
        let parsed: ConfigUrlsResponse = response
            .json()
            .await
            .map_err(|e| NsqError::config_access(format!("malformed config response: {}", e)))?;
        Ok(parsed.urls)
    }

    /// Tear down all agent state. The agent accepts `set_remotes`/`set_env`
    /// and resolves cleanly again afterwards.
    pub fn release(&self) {
        *self.state.write() = AgentState::default();
    }
}

impl Default for ConfigAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    partitions: HashMap<String, PartitionInfo>,
    #[serde(default)]
    meta: Option<LookupMeta>,
}

#[derive(Debug, Deserialize)]
struct PartitionInfo {
    broadcast_address: String,
    tcp_port: u16,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct LookupMeta {
    #[serde(default)]
    ordered: bool,
}

struct CacheEntry {
    addresses: Arc<Vec<Address>>,
    fetched_at: Instant,
}

/// Where a resolver sources its lookup-service base URLs.
enum LookupSource {
    /// User-pinned `host:port` list, remote discovery bypassed
    Pinned(Vec<String>),
    /// Discovered through an injected [`ConfigAgent`]
    Agent(Arc<ConfigAgent>),
}

/// Resolves topics to their current partition endpoints.
pub struct LookupResolver {
    http: reqwest::Client,
    source: LookupSource,
    cache: RwLock<HashMap<(String, AccessType), CacheEntry>>,
    ttl: Duration,
}

impl LookupResolver {
    /// Build a resolver for `config`: pinned addresses when the user
    /// specified them, otherwise the injected agent.
    pub fn for_config(config: &NsqConfig, agent: Option<Arc<ConfigAgent>>) -> Result<Self, NsqError> {
        let source = if config.user_specified_lookup {
            LookupSource::Pinned(config.lookup_addresses.clone())
        } else {
            match agent {
                Some(agent) => LookupSource::Agent(agent),
                None => {
                    return Err(NsqError::validation(
                        "a config agent is required unless lookup addresses are user-specified",
                    ))
                }
            }
        };
        let http = reqwest::Client::builder()
            .timeout(config.query_timeout)
            .build()
            .expect("http client builds");
        Ok(Self {
            http,
            source,
            cache: RwLock::new(HashMap::new()),
            ttl: config.lookup_cache_ttl,
        })
    }

    /// Current partition endpoints for `topic`, ordered by partition id.
    ///
    /// Served from cache within the staleness window. An empty set is a
    /// valid "no such topic yet" answer; a shrunken set reflects partitions
    /// currently absent from the lookup response and reduces parallelism
    /// rather than failing.
    pub async fn lookup(&self, topic: &str, access: AccessType) -> Result<Arc<Vec<Address>>, NsqError> {
        let key = (topic.to_string(), access);
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.addresses.clone());
                }
            }
        }
        self.refresh(topic, access).await
    }

    /// Query the lookup service and swap the cached entry.
    ///
    /// On failure a stale entry keeps serving with a warning; the error only
    /// surfaces when there is no last-known-good set.
    pub async fn refresh(&self, topic: &str, access: AccessType) -> Result<Arc<Vec<Address>>, NsqError> {
        let key = (topic.to_string(), access);
        match self.query(topic, access).await {
            Ok(addresses) => {
                let addresses = Arc::new(addresses);
                self.cache.write().insert(
                    key,
                    CacheEntry {
                        addresses: addresses.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(addresses)
            }
            Err(e) => {
                let cache = self.cache.read();
                match cache.get(&key) {
                    Some(entry) => {
                        warn!(topic = %topic, error = %e, "lookup refresh failed, serving stale entries");
                        Ok(entry.addresses.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn query(&self, topic: &str, access: AccessType) -> Result<Vec<Address>, NsqError> {
        let bases = match &self.source {
            LookupSource::Pinned(addresses) => Arc::new(addresses.clone()),
            LookupSource::Agent(agent) => agent.lookup_urls().await?,
        };
        if bases.is_empty() {
            return Err(NsqError::lookup("no lookup addresses available"));
        }

        let mut last_err = None;
        for base in bases.iter() {
            let url = format!(
                "{}/lookup?topic={}&access={}",
                normalize_base(base),
                topic,
                access.as_query()
            );
            match self.query_one(&url, topic).await {
                Ok(addresses) => return Ok(addresses),
                Err(e) => {
                    warn!(lookup = %base, topic = %topic, error = %e, "lookup query failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NsqError::lookup("no lookup addresses available")))
    }

    async fn query_one(&self, url: &str, topic: &str) -> Result<Vec<Address>, NsqError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| NsqError::lookup(format!("lookup unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(NsqError::lookup(format!(
                "lookup returned status {}",
                response.status()
            )));
        }
        let parsed: LookupResponse = response
            .json()
            .await
            .map_err(|e| NsqError::lookup(format!("malformed lookup response: {}", e)))?;
        Ok(Self::into_addresses(topic, parsed))
    }

    fn into_addresses(topic: &str, response: LookupResponse) -> Vec<Address> {
        let meta = response.meta.unwrap_or_default();
        let mut addresses: Vec<Address> = response
            .partitions
            .into_iter()
            .filter_map(|(id, info)| {
                let partition: i32 = match id.parse() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(topic = %topic, partition = %id, "skipping unparseable partition id");
                        return None;
                    }
                };
                Some(Address::new(
                    info.broadcast_address,
                    info.tcp_port,
                    info.version,
                    topic,
                    partition,
                    meta.ordered,
                ))
            })
            .collect();
        addresses.sort_by_key(|a| a.partition);
        addresses
    }
}

fn normalize_base(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    }
}
