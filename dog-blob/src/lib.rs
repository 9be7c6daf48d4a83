//! # dog-blob: blob sourcing for DogRS relays
//!
//! `dog-blob` turns an object in a backing store into a [`TransferEnvelope`]:
//! the blob's metadata plus either an open byte channel or the fully
//! materialized bytes. Everything downstream (relay hops, HTTP responses)
//! only ever sees envelopes.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_blob::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> RelayResult<()> {
//! let store = Arc::new(MemoryBlobStore::new());
//! store.insert("photos/x.jpg", vec![0u8; 1024], Some("image/jpeg"));
//!
//! let source = BlobSource::new(store, BlobConfig::default());
//!
//! // Streaming: returns as soon as the store has opened the object
//! let envelope = source.fetch("photos/x.jpg").await?;
//! assert_eq!(envelope.metadata.name, "x.jpg");
//! assert_eq!(envelope.content_length(), Some(1024));
//!
//! // Buffered: the whole object is in memory when this returns
//! let envelope = source.fetch_buffered("photos/x.jpg").await?;
//! assert_eq!(envelope.mode(), TransferMode::Buffer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Channel lifecycle
//!
//! A [`StreamingBody`] owns whatever sits behind it (store connection,
//! upstream response). It is closed by dropping it, so every exit path
//! (read to the end, error, early abandonment) releases it exactly once.
//! A failure after the first byte arrives as an error item on the
//! channel; a consumer must treat it as a failed transfer, never as a
//! short file.

mod body;
mod config;
mod error;
pub mod headers;
mod memory_store;
mod s3_store;
mod source;
pub mod store;
mod types;

pub use body::{CloseOutcome, EnvelopeBody, StreamingBody, TransferEnvelope};
pub use config::{BlobConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_BUFFERED_BYTES};
pub use error::{RelayError, RelayErrorKind, RelayResult};
pub use memory_store::{pattern, pattern_byte, Fault, MemoryBlobStore, StoreProbe, DEFAULT_MEMORY_CHUNK};
pub use s3_store::{S3CompatibleStore, S3Config};
pub use source::BlobSource;
pub use store::{BlobStore, OpenedBlob};
pub use types::{BlobMetadata, ByteStream, TransferMode, DEFAULT_MEDIA_TYPE};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobConfig, BlobMetadata, BlobSource, BlobStore, ByteStream, EnvelopeBody, MemoryBlobStore, RelayError,
        RelayResult, StreamingBody, TransferEnvelope, TransferMode,
    };
}
