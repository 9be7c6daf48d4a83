use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dog_blob::S3Config;
use dog_core::{DogConfig, DogConfigSnapshot};
use dog_relay::RelayConfig;

/// Environment variables starting with this prefix override config keys:
/// `RELAY__STORE__KIND=s3` sets `store.kind`.
pub const ENV_PREFIX: &str = "RELAY__";

/// Defaults, then the process environment.
pub fn load() -> DogConfig {
    let mut config = defaults();
    let applied = config.load_env(ENV_PREFIX);
    tracing::debug!(applied, "environment overrides");
    config
}

pub fn defaults() -> DogConfig {
    let mut config = DogConfig::new();
    config.set_default("http.host", "127.0.0.1");
    config.set_default("http.port", "3030");
    config.set_default("store.kind", "memory");
    config.set_default("relay.mode", "stream");
    config.set_default("runtime.flavor", "multi_thread");
    config
}

/// Where this node reads objects from.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    S3(S3Config),
    /// Download route of another relay node, e.g.
    /// `http://origin:3030/api/files/download`.
    Upstream(String),
    Memory,
}

impl StoreConfig {
    pub fn from_snapshot(config: &DogConfigSnapshot) -> Result<Self> {
        let kind = config.get("store.kind").unwrap_or("memory");
        match kind.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StoreConfig::S3(S3Config::from_snapshot(config)?)),
            "upstream" => config
                .get_string("store.upstream")
                .map(StoreConfig::Upstream)
                .ok_or_else(|| anyhow!("store.kind=upstream needs store.upstream")),
            "memory" => Ok(StoreConfig::Memory),
            other => Err(anyhow!("unknown store.kind: {other}")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::S3(_) => "s3",
            StoreConfig::Upstream(_) => "upstream",
            StoreConfig::Memory => "memory",
        }
    }
}

/// Shape of the tokio runtime the node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeConfig {
    CurrentThread,
    /// `None` lets tokio pick one worker per core.
    MultiThread { worker_threads: Option<usize> },
}

impl RuntimeConfig {
    /// `runtime.flavor` is `current_thread` or `multi_thread`;
    /// `runtime.worker_threads` sizes the latter, and `0` there selects
    /// the former.
    pub fn from_snapshot(config: &DogConfigSnapshot) -> Result<Self> {
        let workers = match config.get("runtime.worker_threads") {
            Some(raw) => Some(
                usize::from_str(raw.trim()).with_context(|| format!("invalid runtime.worker_threads: {raw}"))?,
            ),
            None => None,
        };
        let flavor = config.get("runtime.flavor").unwrap_or("multi_thread");
        match (flavor.trim().to_ascii_lowercase().as_str(), workers) {
            ("current_thread", _) | (_, Some(0)) => Ok(RuntimeConfig::CurrentThread),
            ("multi_thread", worker_threads) => Ok(RuntimeConfig::MultiThread { worker_threads }),
            (other, _) => Err(anyhow!("unknown runtime.flavor: {other}")),
        }
    }

    pub fn build(&self) -> Result<tokio::runtime::Runtime> {
        let mut builder = match self {
            RuntimeConfig::CurrentThread => tokio::runtime::Builder::new_current_thread(),
            RuntimeConfig::MultiThread { worker_threads } => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                if let Some(n) = worker_threads {
                    builder.worker_threads(*n);
                }
                builder
            }
        };
        builder.enable_all().build().context("building tokio runtime")
    }
}

/// Everything one relay node needs to start.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    /// Served by the key-less download routes.
    pub default_key: Option<String>,
    pub relay: RelayConfig,
    pub runtime: RuntimeConfig,
}

impl ServiceConfig {
    pub fn from_snapshot(config: &DogConfigSnapshot) -> Result<Self> {
        let port = match config.get("http.port") {
            Some(port) => u16::from_str(port.trim()).with_context(|| format!("invalid http.port: {port}"))?,
            None => 3030,
        };

        Ok(Self {
            host: config.get_string("http.host").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            store: StoreConfig::from_snapshot(config)?,
            default_key: config.get_string("store.default_key"),
            relay: RelayConfig::from_snapshot(config)?,
            runtime: RuntimeConfig::from_snapshot(config)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
