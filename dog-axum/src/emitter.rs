//! Writing a terminal envelope to the requester.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dog_blob::headers::metadata_headers;
use dog_blob::{EnvelopeBody, TransferEnvelope};

/// Consumes the envelope a pipeline returned and turns it into the HTTP
/// response.
///
/// Content type, disposition and (when known) length go out with the
/// status line, before the first body byte. Streaming bodies are
/// forwarded chunk by chunk as they arrive. Once the status has been sent
/// nothing can report an error any more, so a failure on the stream makes
/// hyper abort the connection: the requester sees a truncated transfer,
/// never a short body that looks complete. Dropping the response (the
/// requester went away) drops the stream, which closes every upstream
/// channel.
#[derive(Debug)]
pub struct ResponseEmitter {
    envelope: TransferEnvelope,
}

impl ResponseEmitter {
    pub fn new(envelope: TransferEnvelope) -> Self {
        Self { envelope }
    }
}

impl From<TransferEnvelope> for ResponseEmitter {
    fn from(envelope: TransferEnvelope) -> Self {
        Self::new(envelope)
    }
}

impl IntoResponse for ResponseEmitter {
    fn into_response(self) -> Response {
        let TransferEnvelope { metadata, body } = self.envelope;
        let headers = metadata_headers(&metadata);

        let body = match body {
            EnvelopeBody::Buffered(bytes) => Body::from(bytes),
            EnvelopeBody::Streaming(stream) => Body::from_stream(stream),
        };

        (StatusCode::OK, headers, body).into_response()
    }
}
