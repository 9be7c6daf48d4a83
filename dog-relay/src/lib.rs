//! # dog-relay: streaming blob relay for DogRS
//!
//! A [`RelayPipeline`] composes a [`BlobSource`](dog_blob::BlobSource) with
//! zero or more [`RelayHop`]s. Each hop moves a
//! [`TransferEnvelope`](dog_blob::TransferEnvelope) across one network
//! boundary, either streaming it through or buffering it first.
//!
//! ```text
//! BlobStore ──► BlobSource ──► hop 1 ──► ... ──► hop K ──► caller
//!                    (envelope)     (envelope)        (envelope)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_blob::{BlobConfig, BlobSource, MemoryBlobStore, TransferMode};
//! use dog_relay::{ConnectionPool, HttpHop, PoolConfig, RelayPipeline};
//!
//! # #[tokio::main]
//! # async fn main() -> dog_blob::RelayResult<()> {
//! let store = Arc::new(MemoryBlobStore::new());
//! store.insert("reports/q3.pdf", vec![0u8; 4096], Some("application/pdf"));
//!
//! let pool = ConnectionPool::new(PoolConfig::default())?;
//! let edge = HttpHop::new(
//!     "edge",
//!     "http://edge:3030/api/files/relay".parse().unwrap(),
//!     pool,
//! );
//!
//! let pipeline = RelayPipeline::new(BlobSource::new(store, BlobConfig::default()))
//!     .with_hop(edge)
//!     .with_mode(TransferMode::Stream);
//!
//! let envelope = pipeline.run("reports/q3.pdf").await?;
//! assert_eq!(envelope.metadata.media_type, "application/pdf");
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! Errors raised before the terminal envelope is returned abort the
//! invocation and release every channel opened by earlier legs. Errors
//! raised later arrive on the terminal body, tagged with the leg they
//! came from (`0` is the backing store). A consumer that stops reading
//! simply drops the body, which cancels every upstream leg.

mod config;
mod hop;
mod pipeline;
mod pool;
mod upstream;

pub use config::{HopSpec, RelayConfig};
pub use hop::{HttpHop, MetadataOverrides, RelayHop};
pub use pipeline::{RelayPipeline, RelayState, RelayTracker, SOURCE_INDEX};
pub use pool::{
    ConnectionPool, PoolConfig, PoolLease, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_CONNECTIONS_PER_HOST,
};
pub use upstream::HttpBlobStore;

/// Build the HTTP hops listed in `config`, sharing one pool.
pub fn http_hops(config: &RelayConfig, pool: &ConnectionPool) -> Vec<std::sync::Arc<dyn RelayHop>> {
    let overrides = MetadataOverrides {
        media_type: None,
        disposition: config.disposition.clone(),
    };
    config
        .hops
        .iter()
        .map(|spec| {
            let hop = HttpHop::from_spec(spec, pool.clone())
                .with_overrides(overrides.clone())
                .with_idle_timeout(config.blob.idle_timeout)
                .with_max_buffered_bytes(config.blob.max_buffered_bytes);
            std::sync::Arc::new(hop) as std::sync::Arc<dyn RelayHop>
        })
        .collect()
}
