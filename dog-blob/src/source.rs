use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    BlobConfig, BlobMetadata, BlobStore, OpenedBlob, RelayError, RelayResult, StreamingBody, TransferEnvelope,
    TransferMode,
};

/// Fetches single blobs from a backing store as envelopes.
///
/// Each call opens exactly one store channel. In streaming mode the
/// channel is handed to the caller inside the envelope; in buffered mode
/// it is read to the end (or until it fails) and released before the
/// call returns.
#[derive(Clone)]
pub struct BlobSource {
    store: Arc<dyn BlobStore>,
    config: BlobConfig,
}

impl BlobSource {
    pub fn new(store: Arc<dyn BlobStore>, config: BlobConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Open `key` and return a streaming envelope as soon as the store
    /// confirms the object exists.
    pub async fn fetch(&self, key: &str) -> RelayResult<TransferEnvelope> {
        let opened = self.open(key).await?;
        let metadata = Self::metadata_for(key, &opened);

        let mut body = StreamingBody::new(opened.stream).with_length_check(metadata.content_length);
        if let Some(idle) = self.config.idle_timeout {
            body = body.with_idle_timeout(idle);
        }

        Ok(TransferEnvelope::streaming(metadata, body))
    }

    /// Read the whole object into memory before returning.
    pub async fn fetch_buffered(&self, key: &str) -> RelayResult<TransferEnvelope> {
        let envelope = self.fetch(key).await?;
        envelope
            .into_buffered(Some(self.config.max_buffered_bytes))
            .await
            .inspect_err(|e| warn!(key, error = %e, "buffered read failed"))
    }

    pub async fn fetch_with_mode(&self, key: &str, mode: TransferMode) -> RelayResult<TransferEnvelope> {
        match mode {
            TransferMode::Stream => self.fetch(key).await,
            TransferMode::Buffer => self.fetch_buffered(key).await,
        }
    }

    async fn open(&self, key: &str) -> RelayResult<OpenedBlob> {
        if key.trim().is_empty() {
            return Err(RelayError::invalid("blob key must not be empty"));
        }

        let opened = self.store.open(key).await?;
        debug!(
            key,
            backend = self.store.backend(),
            size = ?opened.size_bytes,
            "backing store channel opened"
        );
        Ok(opened)
    }

    fn metadata_for(key: &str, opened: &OpenedBlob) -> BlobMetadata {
        let mut metadata = BlobMetadata::for_key(key);
        if let Some(name) = opened.filename.as_deref().filter(|n| !n.trim().is_empty()) {
            metadata = metadata.with_name(name);
        }
        metadata
            .with_media_type(opened.content_type.as_deref())
            .with_disposition(opened.content_disposition.as_deref())
            .with_content_length(opened.size_bytes)
    }
}
