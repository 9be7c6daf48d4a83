use bytes::Bytes;
use futures_core::Stream;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use crate::{headers, RelayError};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// Media type used when the backing store does not report one.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// How a stage moves an envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferMode {
    /// Bytes flow through as they are produced.
    #[default]
    Stream,
    /// The body is fully materialized before it is forwarded.
    Buffer,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Stream => "stream",
            TransferMode::Buffer => "buffer",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "streaming" => Ok(TransferMode::Stream),
            "buffer" | "buffered" | "bytes" => Ok(TransferMode::Buffer),
            other => Err(RelayError::invalid(format!("unknown transfer mode: {other}"))),
        }
    }
}

/// Metadata that travels alongside blob bytes across every hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Display filename
    pub name: String,
    /// MIME type, never empty
    pub media_type: String,
    /// Exact byte count, when known up front
    pub content_length: Option<u64>,
    /// Rendering hint, e.g. `attachment; filename="x.jpg"`
    pub disposition: String,
}

impl BlobMetadata {
    /// Metadata with defaults for `name`: octet-stream, attachment, unknown length.
    pub fn new<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        Self {
            disposition: headers::attachment_disposition(&name),
            name,
            media_type: DEFAULT_MEDIA_TYPE.to_string(),
            content_length: None,
        }
    }

    /// Metadata named after the final path segment of a store key.
    pub fn for_key(key: &str) -> Self {
        Self::new(headers::name_from_key(key))
    }

    /// Set the media type; blank values keep the current one.
    pub fn with_media_type<S: AsRef<str>>(mut self, media_type: Option<S>) -> Self {
        if let Some(mt) = media_type {
            let mt = mt.as_ref().trim();
            if !mt.is_empty() {
                self.media_type = mt.to_string();
            }
        }
        self
    }

    /// Set the disposition; blank values keep the current one.
    pub fn with_disposition<S: AsRef<str>>(mut self, disposition: Option<S>) -> Self {
        if let Some(d) = disposition {
            let d = d.as_ref().trim();
            if !d.is_empty() {
                self.disposition = d.to_string();
            }
        }
        self
    }

    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }

    /// Rename and regenerate the default disposition for the new name.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self.disposition = headers::attachment_disposition(&self.name);
        self
    }
}
