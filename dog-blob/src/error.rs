use dog_core::{DogError, ErrorKind};
use thiserror::Error;

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while sourcing or relaying a blob.
///
/// Payloads are plain strings so the error can be cloned into every
/// place that needs to observe it (stream guards, logs, responses).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Backing store unavailable: {message}")]
    BackingStoreUnavailable { message: String },

    #[error("Upstream unreachable: {message}")]
    UpstreamUnreachable { message: String },

    #[error("Upstream responded with status {status}: {message}")]
    UpstreamErrorStatus { status: u16, message: String },

    #[error("Transfer aborted: {message}")]
    MidTransferAbort { message: String },

    #[error("Content length mismatch: declared {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("Consumer disconnected")]
    ConsumerDisconnected,

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Hop {index} ({hop}) failed: {source}")]
    Hop {
        index: usize,
        hop: String,
        #[source]
        source: Box<RelayError>,
    },
}

/// Coarse classification of a [`RelayError`], independent of any hop
/// context wrapped around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    NotFound,
    BackingStoreUnavailable,
    UpstreamUnreachable,
    UpstreamErrorStatus,
    MidTransferAbort,
    LengthMismatch,
    ConsumerDisconnected,
    PayloadTooLarge,
    Invalid,
}

impl RelayError {
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::BackingStoreUnavailable {
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::UpstreamUnreachable {
            message: message.into(),
        }
    }

    pub fn error_status<S: Into<String>>(status: u16, message: S) -> Self {
        Self::UpstreamErrorStatus {
            status,
            message: message.into(),
        }
    }

    pub fn aborted<S: Into<String>>(message: S) -> Self {
        Self::MidTransferAbort {
            message: message.into(),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Attach path context. An error that already carries hop context
    /// keeps the innermost attribution.
    pub fn at_hop<S: Into<String>>(self, index: usize, hop: S) -> Self {
        match self {
            Self::Hop { .. } => self,
            other => Self::Hop {
                index,
                hop: hop.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error without any hop context.
    pub fn root(&self) -> &RelayError {
        match self {
            Self::Hop { source, .. } => source.root(),
            other => other,
        }
    }

    /// `(index, name)` of the hop this error is attributed to, if any.
    pub fn hop(&self) -> Option<(usize, &str)> {
        match self {
            Self::Hop { index, hop, .. } => Some((*index, hop.as_str())),
            _ => None,
        }
    }

    pub fn kind(&self) -> RelayErrorKind {
        match self.root() {
            Self::NotFound { .. } => RelayErrorKind::NotFound,
            Self::BackingStoreUnavailable { .. } => RelayErrorKind::BackingStoreUnavailable,
            Self::UpstreamUnreachable { .. } => RelayErrorKind::UpstreamUnreachable,
            Self::UpstreamErrorStatus { .. } => RelayErrorKind::UpstreamErrorStatus,
            Self::MidTransferAbort { .. } => RelayErrorKind::MidTransferAbort,
            Self::LengthMismatch { .. } => RelayErrorKind::LengthMismatch,
            Self::ConsumerDisconnected => RelayErrorKind::ConsumerDisconnected,
            Self::PayloadTooLarge { .. } => RelayErrorKind::PayloadTooLarge,
            Self::Invalid { .. } => RelayErrorKind::Invalid,
            Self::Hop { .. } => unreachable!("root() strips hop context"),
        }
    }

    /// Status class reported to a requester when nothing was written yet.
    pub fn error_kind(&self) -> ErrorKind {
        match self.kind() {
            RelayErrorKind::NotFound => ErrorKind::NotFound,
            RelayErrorKind::BackingStoreUnavailable => ErrorKind::Unavailable,
            RelayErrorKind::UpstreamUnreachable
            | RelayErrorKind::UpstreamErrorStatus
            | RelayErrorKind::MidTransferAbort
            | RelayErrorKind::LengthMismatch => ErrorKind::BadGateway,
            RelayErrorKind::ConsumerDisconnected => ErrorKind::ClientClosedRequest,
            RelayErrorKind::PayloadTooLarge => ErrorKind::PayloadTooLarge,
            RelayErrorKind::Invalid => ErrorKind::BadRequest,
        }
    }

    /// Convert into the client-facing DogError. Hop context travels as
    /// `data.hop` so callers can tell which leg of the path failed.
    pub fn to_dog_error(&self) -> DogError {
        let err = DogError::new(self.error_kind(), self.to_string());
        match self.hop() {
            Some((index, hop)) => err.with_data(serde_json::json!({
                "hop": { "index": index, "name": hop }
            })),
            None => err,
        }
    }

    /// True if this failure is the consumer walking away rather than a
    /// fault anywhere on the path.
    pub fn is_consumer_disconnect(&self) -> bool {
        self.kind() == RelayErrorKind::ConsumerDisconnected
    }
}

impl From<RelayError> for std::io::Error {
    fn from(err: RelayError) -> Self {
        std::io::Error::other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_context_never_downgrades_kind() {
        let err = RelayError::error_status(500, "boom").at_hop(2, "edge");
        assert_eq!(err.kind(), RelayErrorKind::UpstreamErrorStatus);
        assert_eq!(err.hop(), Some((2, "edge")));
        assert_eq!(err.error_kind(), ErrorKind::BadGateway);

        // re-wrapping keeps the original attribution
        let rewrapped = err.clone().at_hop(5, "outer");
        assert_eq!(rewrapped, err);
    }

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(RelayError::not_found("a/b").error_kind().status_code(), 404);
        assert_eq!(RelayError::unavailable("down").error_kind().status_code(), 503);
        assert_eq!(RelayError::unreachable("refused").error_kind().status_code(), 502);
        assert_eq!(RelayError::invalid("empty key").error_kind().status_code(), 400);
        assert_eq!(
            RelayError::PayloadTooLarge { size: 10, max: 5 }
                .error_kind()
                .status_code(),
            413
        );
    }

    #[test]
    fn display_includes_hop() {
        let err = RelayError::aborted("idle for 30s").at_hop(1, "gateway");
        assert_eq!(
            err.to_string(),
            "Hop 1 (gateway) failed: Transfer aborted: idle for 30s"
        );
    }
}
