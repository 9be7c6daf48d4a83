pub mod config;

use std::sync::Arc;

use anyhow::Result;
use dog_axum::{axum, AxumApp, DogAxumState};
use dog_blob::{BlobSource, BlobStore, MemoryBlobStore, S3CompatibleStore};
use dog_relay::{http_hops, ConnectionPool, HttpBlobStore, RelayPipeline};
use tracing::info;

pub use config::{RuntimeConfig, ServiceConfig, StoreConfig};

/// Size of the object a memory node generates under its default key.
const SAMPLE_BYTES: u64 = 1 << 20;

/// Open the backing store, wire the configured hops and return the app.
pub async fn build(config: &ServiceConfig) -> Result<AxumApp> {
    let pool = ConnectionPool::new(config.relay.pool.clone())?;
    let store = open_store(config, &pool).await?;
    Ok(assemble(config, pool, store))
}

/// Same as [`build`] over an already opened store.
pub fn assemble(config: &ServiceConfig, pool: ConnectionPool, store: Arc<dyn BlobStore>) -> AxumApp {
    let relay = &config.relay;
    let hops = http_hops(relay, &pool);
    info!(
        store = store.backend(),
        mode = %relay.mode,
        hops = hops.len(),
        default_key = config.default_key.as_deref().unwrap_or("-"),
        "relay node configured"
    );

    let source = BlobSource::new(store, relay.blob.clone());
    let pipeline = RelayPipeline::new(source).with_hops(hops).with_mode(relay.mode);

    axum(DogAxumState::new(pipeline).with_default_key(config.default_key.as_deref()))
}

pub async fn open_store(config: &ServiceConfig, pool: &ConnectionPool) -> Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match &config.store {
        StoreConfig::S3(s3) => Arc::new(S3CompatibleStore::new(s3.clone()).await),
        StoreConfig::Upstream(base) => Arc::new(
            HttpBlobStore::parse(base, pool.clone())?.with_idle_timeout(config.relay.blob.idle_timeout),
        ),
        StoreConfig::Memory => {
            // scratch node: one generated object so the path can be tried
            // without any infrastructure
            let memory = MemoryBlobStore::new();
            if let Some(key) = &config.default_key {
                memory.insert_generated(key.as_str(), SAMPLE_BYTES, None);
            }
            Arc::new(memory)
        }
    };
    Ok(store)
}
