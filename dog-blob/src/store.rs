use async_trait::async_trait;

use crate::{ByteStream, RelayResult};

/// Read side of a backing object store.
///
/// `open` must either fail before any byte is produced (`NotFound`,
/// `BackingStoreUnavailable`) or hand back an open channel. Faults after
/// that point surface as error items on the channel. Dropping the
/// returned stream releases the store connection.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a read channel to the object at `key`.
    async fn open(&self, key: &str) -> RelayResult<OpenedBlob>;

    /// Short backend label for logs.
    fn backend(&self) -> &'static str;
}

/// An object the store has confirmed exists, with its channel open.
pub struct OpenedBlob {
    pub stream: ByteStream,
    pub size_bytes: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    /// Display name, when the store knows a better one than the key.
    pub filename: Option<String>,
}

impl OpenedBlob {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            size_bytes: None,
            content_type: None,
            content_disposition: None,
            filename: None,
        }
    }

    pub fn with_size(mut self, size_bytes: Option<u64>) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_content_disposition(mut self, disposition: Option<String>) -> Self {
        self.content_disposition = disposition;
        self
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename;
        self
    }
}

impl std::fmt::Debug for OpenedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBlob")
            .field("size_bytes", &self.size_bytes)
            .field("content_type", &self.content_type)
            .field("content_disposition", &self.content_disposition)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}
