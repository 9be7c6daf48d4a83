use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dog_blob::{RelayError, RelayResult};
use dog_core::DogConfigSnapshot;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 20;

/// Limits for outbound connections.
///
/// A streamed relay holds one slot per HTTP hop for as long as its
/// response body is open, plus one for an upstream store, so a single
/// invocation over `k` hops occupies up to `k + 1` slots at once. Size
/// `max_connections` for the concurrent invocations times that figure.
/// A caller that cannot get a slot within `connect_timeout` fails with
/// an unreachable error instead of waiting on its own earlier leases.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection establishment timeout; also bounds how long a caller
    /// waits for a free slot.
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
        }
    }
}

impl PoolConfig {
    pub fn from_snapshot(config: &DogConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: config
                .get_duration_secs("relay.connect_timeout_secs")
                .unwrap_or(defaults.connect_timeout),
            max_connections: config
                .get_usize("relay.max_connections")
                .unwrap_or(defaults.max_connections)
                .max(1),
            max_connections_per_host: config
                .get_usize("relay.max_connections_per_host")
                .unwrap_or(defaults.max_connections_per_host)
                .max(1),
        }
    }
}

/// Outbound HTTP client with a global and a per-destination ceiling on
/// concurrent exchanges.
///
/// This is the only state relay invocations share. Callers take a
/// [`PoolLease`] before each exchange and keep it for as long as the
/// exchange (including a streamed response body) is alive.
#[derive(Clone)]
pub struct ConnectionPool {
    client: Client,
    config: PoolConfig,
    total: Arc<Semaphore>,
    hosts: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("available", &self.available())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> RelayResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .map_err(|e| RelayError::invalid(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            total: Arc::new(Semaphore::new(config.max_connections)),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Free global slots.
    pub fn available(&self) -> usize {
        self.total.available_permits()
    }

    /// Free slots for the destination of `url`.
    pub fn available_for(&self, url: &Url) -> usize {
        self.hosts
            .lock()
            .get(&destination(url))
            .map(|s| s.available_permits())
            .unwrap_or(self.config.max_connections_per_host)
    }

    /// Wait for a slot towards `url`. Waiting longer than the connect
    /// timeout counts as the upstream being unreachable.
    pub async fn acquire(&self, url: &Url) -> RelayResult<PoolLease> {
        let host = destination(url);
        let per_host = {
            let mut hosts = self.hosts.lock();
            // a semaphore only the map refers to has no lease or waiter
            hosts.retain(|name, sem| *name == host || Arc::strong_count(sem) > 1);
            hosts
                .entry(host.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections_per_host)))
                .clone()
        };

        let wait = async {
            let host_permit = per_host.acquire_owned().await;
            let total_permit = self.total.clone().acquire_owned().await;
            (host_permit, total_permit)
        };

        match tokio::time::timeout(self.config.connect_timeout, wait).await {
            Ok((Ok(host_permit), Ok(total_permit))) => Ok(PoolLease {
                host,
                _host: host_permit,
                _total: total_permit,
            }),
            Ok(_) => Err(RelayError::unreachable("connection pool closed")),
            Err(_) => Err(RelayError::unreachable(format!(
                "no free connection to {host} within {:?}",
                self.config.connect_timeout
            ))),
        }
    }
}

#[cfg(test)]
impl ConnectionPool {
    fn tracked_hosts(&self) -> usize {
        self.hosts.lock().len()
    }
}

/// A held slot in the pool; released on drop.
#[derive(Debug)]
pub struct PoolLease {
    host: String,
    _host: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

impl PoolLease {
    pub fn host(&self) -> &str {
        &self.host
    }
}

fn destination(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

/// Map a transport failure onto the relay taxonomy. Anything that
/// happens while a body is moving is a mid-transfer abort; everything
/// else means the peer could not be reached.
pub(crate) fn classify(err: &reqwest::Error, target: &str) -> RelayError {
    if err.is_body() || err.is_decode() {
        RelayError::aborted(format!("transfer with {target} broke off: {err}"))
    } else if err.is_timeout() {
        RelayError::unreachable(format!("{target} timed out: {err}"))
    } else {
        RelayError::unreachable(format!("{target} unreachable: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    fn small_pool(total: usize, per_host: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            connect_timeout: Duration::from_millis(200),
            max_connections: total,
            max_connections_per_host: per_host,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn per_host_ceiling_is_enforced() {
        let pool = small_pool(10, 1);
        let a: Url = "http://127.0.0.1:9001/x".parse().unwrap();
        let b: Url = "http://127.0.0.1:9002/x".parse().unwrap();

        let lease = pool.acquire(&a).await.unwrap();
        assert_eq!(lease.host(), "127.0.0.1:9001");
        assert_eq!(pool.available_for(&a), 0);

        // a different destination is unaffected
        let _other = pool.acquire(&b).await.unwrap();

        let blocked = pool.acquire(&a).await;
        assert!(matches!(blocked, Err(RelayError::UpstreamUnreachable { .. })));

        drop(lease);
        assert!(pool.acquire(&a).await.is_ok());
    }

    #[tokio::test]
    async fn global_ceiling_is_enforced() {
        let pool = small_pool(2, 5);
        let a: Url = "http://a.test/".parse().unwrap();
        let b: Url = "http://b.test/".parse().unwrap();
        let c: Url = "http://c.test/".parse().unwrap();

        let _l1 = pool.acquire(&a).await.unwrap();
        let _l2 = pool.acquire(&b).await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(&c).await.is_err());
        // a timed out waiter must not keep its per-host slot
        assert_eq!(pool.available_for(&c), 5);
    }

    #[tokio::test]
    async fn idle_destinations_are_forgotten() {
        let pool = small_pool(10, 2);
        let urls: Vec<Url> = (0..5)
            .map(|i| format!("http://host{i}.test/").parse().unwrap())
            .collect();

        let held = pool.acquire(&urls[0]).await.unwrap();
        for url in &urls[1..] {
            drop(pool.acquire(url).await.unwrap());
        }
        // the last one is still mapped; earlier idle ones were pruned
        assert_eq!(pool.tracked_hosts(), 2);

        drop(pool.acquire(&urls[1]).await.unwrap());
        assert_eq!(pool.tracked_hosts(), 2);
        assert_eq!(pool.available_for(&urls[0]), 1);
        assert_eq!(pool.available_for(&urls[4]), 2);

        drop(held);
        drop(pool.acquire(&urls[2]).await.unwrap());
        assert_eq!(pool.tracked_hosts(), 1);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn config_from_snapshot() {
        let mut config = DogConfig::new();
        config.set("relay.connect_timeout_secs", "3");
        config.set("relay.max_connections", "0");
        let pool = PoolConfig::from_snapshot(&config.snapshot());
        assert_eq!(pool.connect_timeout, Duration::from_secs(3));
        assert_eq!(pool.max_connections, 1);
        assert_eq!(pool.max_connections_per_host, DEFAULT_MAX_CONNECTIONS_PER_HOST);
    }
}
