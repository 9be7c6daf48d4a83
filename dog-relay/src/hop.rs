use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dog_blob::headers::{merge_headers, metadata_headers};
use dog_blob::{
    BlobMetadata, EnvelopeBody, RelayError, RelayResult, StreamingBody, TransferEnvelope, TransferMode,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Response, Url};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pool::{classify, ConnectionPool, PoolLease};
use crate::HopSpec;

/// Largest error body read back from a peer to build a message.
const ERROR_BODY_LIMIT: u64 = 16 * 1024;

/// Slice size used when uploading a buffered body.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// One network boundary crossing.
///
/// A hop takes ownership of the inbound envelope and hands back a new
/// one. Whatever happens, it must not leave the inbound channel or its
/// own outbound exchange open once it returns an error; on success the
/// returned envelope owns everything still open.
#[async_trait]
pub trait RelayHop: Send + Sync {
    fn name(&self) -> &str;

    /// Mode pinned for this hop. `None` follows the pipeline.
    fn mode(&self) -> Option<TransferMode> {
        None
    }

    async fn forward(&self, envelope: TransferEnvelope, mode: TransferMode) -> RelayResult<TransferEnvelope>;
}

/// Explicit metadata a hop stamps on what it forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataOverrides {
    pub media_type: Option<String>,
    pub disposition: Option<String>,
}

impl MetadataOverrides {
    pub fn is_empty(&self) -> bool {
        self.media_type.is_none() && self.disposition.is_none()
    }

    pub fn apply(&self, metadata: BlobMetadata) -> BlobMetadata {
        metadata
            .with_media_type(self.media_type.as_deref())
            .with_disposition(self.disposition.as_deref())
    }
}

/// Forwards envelopes to a peer relay's ingress route over HTTP.
///
/// The metadata rides in `Content-Type`, `Content-Disposition` and,
/// when known, `Content-Length`; the peer's response becomes the next
/// envelope.
pub struct HttpHop {
    name: String,
    target: Url,
    pool: ConnectionPool,
    mode: Option<TransferMode>,
    overrides: MetadataOverrides,
    idle_timeout: Option<Duration>,
    max_buffered_bytes: u64,
}

impl HttpHop {
    pub fn new<S: Into<String>>(name: S, target: Url, pool: ConnectionPool) -> Self {
        Self {
            name: name.into(),
            target,
            pool,
            mode: None,
            overrides: MetadataOverrides::default(),
            idle_timeout: Some(dog_blob::DEFAULT_IDLE_TIMEOUT),
            max_buffered_bytes: dog_blob::DEFAULT_MAX_BUFFERED_BYTES,
        }
    }

    pub fn from_spec(spec: &HopSpec, pool: ConnectionPool) -> Self {
        Self::new(spec.name.clone(), spec.url.clone(), pool).with_mode(spec.mode)
    }

    pub fn with_mode(mut self, mode: Option<TransferMode>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_overrides(mut self, overrides: MetadataOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn with_max_buffered_bytes(mut self, max: u64) -> Self {
        self.max_buffered_bytes = max;
        self
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    fn request(&self, metadata: &BlobMetadata) -> reqwest::RequestBuilder {
        self.pool
            .client()
            .post(self.target.clone())
            .headers(metadata_headers(metadata))
    }

    /// The peer's status is checked before any response byte is passed on.
    async fn check_status(&self, response: Response) -> RelayResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = error_detail(response, self.idle_timeout).await;
        warn!(hop = %self.name, status = status.as_u16(), %detail, "peer rejected relay");
        Err(RelayError::error_status(
            status.as_u16(),
            format!("{} answered {status}: {detail}", self.target),
        ))
    }

    async fn forward_streaming(&self, envelope: TransferEnvelope) -> RelayResult<TransferEnvelope> {
        let lease = self.pool.acquire(&self.target).await?;
        let (metadata, body) = envelope.into_parts();
        let inbound = match body {
            EnvelopeBody::Streaming(stream) => stream,
            EnvelopeBody::Buffered(bytes) => StreamingBody::from_bytes(bytes),
        };

        // Dropping the returned stream cancels the upload and drops the
        // inbound channel with it.
        let cancel = CancellationToken::new();
        let inbound_failure: FailureSlot = Arc::new(Mutex::new(None));
        let progress = Arc::new(AtomicU64::new(0));
        let upload = upload_body(inbound, cancel.clone(), inbound_failure.clone(), progress.clone());

        let sent = self
            .await_headers(self.request(&metadata).body(upload).send(), &progress)
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let inbound_err = inbound_failure.lock().take();
                cancel.cancel();
                return Err(inbound_err.unwrap_or(err));
            }
        };
        let response = match self.check_status(response).await {
            Ok(response) => response,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        let metadata = merge_headers(metadata, response.headers());
        debug!(hop = %self.name, length = ?metadata.content_length, "peer accepted streaming relay");

        let body = response_stream(
            response,
            self.target.to_string(),
            lease,
            cancel,
            inbound_failure,
        )
        .with_length_check(metadata.content_length);
        let body = match self.idle_timeout {
            Some(idle) => body.with_idle_timeout(idle),
            None => body,
        };

        Ok(TransferEnvelope::streaming(metadata, body))
    }

    async fn forward_buffered(&self, envelope: TransferEnvelope) -> RelayResult<TransferEnvelope> {
        let max = Some(self.max_buffered_bytes);
        let (metadata, body) = envelope.into_buffered(max).await?.into_parts();
        let payload = match body {
            EnvelopeBody::Buffered(bytes) => bytes,
            EnvelopeBody::Streaming(stream) => stream.collect_bytes(max).await?,
        };

        let lease = self.pool.acquire(&self.target).await?;
        let progress = Arc::new(AtomicU64::new(0));
        let upload = counted_body(payload, progress.clone());
        let response = self
            .await_headers(self.request(&metadata).body(upload).send(), &progress)
            .await?;
        let response = self.check_status(response).await?;

        let metadata = merge_headers(metadata, response.headers());
        let declared = metadata.content_length;
        let body = response_stream(
            response,
            self.target.to_string(),
            lease,
            CancellationToken::new(),
            Arc::new(Mutex::new(None)),
        )
        .with_length_check(declared);
        let body = match self.idle_timeout {
            Some(idle) => body.with_idle_timeout(idle),
            None => body,
        };

        let bytes = body.collect_bytes(max).await?;
        debug!(hop = %self.name, bytes = bytes.len(), "peer returned buffered relay");
        Ok(TransferEnvelope::buffered(metadata, bytes))
    }

    /// Wait for the peer's response headers. Gives up once a whole idle
    /// period passes with neither headers nor upload progress; a peer
    /// that reads the upload before answering is not cut off.
    async fn await_headers<F>(&self, send: F, progress: &AtomicU64) -> RelayResult<Response>
    where
        F: Future<Output = reqwest::Result<Response>>,
    {
        let Some(idle) = self.idle_timeout else {
            return send.await.map_err(|e| classify(&e, self.target.as_str()));
        };

        tokio::pin!(send);
        let mut seen = progress.load(Ordering::SeqCst);
        loop {
            match tokio::time::timeout(idle, &mut send).await {
                Ok(sent) => return sent.map_err(|e| classify(&e, self.target.as_str())),
                Err(_) => {
                    let now = progress.load(Ordering::SeqCst);
                    if now == seen {
                        warn!(hop = %self.name, ?idle, "peer stalled before answering");
                        return Err(RelayError::unreachable(format!(
                            "{} sent no response within {idle:?}",
                            self.target
                        )));
                    }
                    seen = now;
                }
            }
        }
    }
}

#[async_trait]
impl RelayHop for HttpHop {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> Option<TransferMode> {
        self.mode
    }

    async fn forward(&self, envelope: TransferEnvelope, mode: TransferMode) -> RelayResult<TransferEnvelope> {
        let envelope = if self.overrides.is_empty() {
            envelope
        } else {
            envelope.map_metadata(|m| self.overrides.apply(m))
        };

        match mode {
            TransferMode::Stream => self.forward_streaming(envelope).await,
            TransferMode::Buffer => self.forward_buffered(envelope).await,
        }
    }
}

type FailureSlot = Arc<Mutex<Option<RelayError>>>;

/// Feed `inbound` to the outbound request from its own task, so the
/// inbound channel is dropped on cancellation even while the transport
/// has stopped polling the request body. An upload that does not reach
/// the end of its inbound channel ends with an error, never cleanly.
fn upload_body(
    inbound: StreamingBody,
    cancel: CancellationToken,
    failure: FailureSlot,
    progress: Arc<AtomicU64>,
) -> reqwest::Body {
    let (tx, mut rx) = mpsc::channel::<RelayResult<Bytes>>(1);
    let ended = Arc::new(AtomicBool::new(false));
    let pump_ended = ended.clone();

    tokio::spawn(async move {
        let mut inbound = inbound.with_cancellation(cancel.clone());
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            match inbound.next().await {
                Some(Ok(chunk)) => {
                    progress.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                    permit.send(Ok(chunk));
                }
                Some(Err(err)) => {
                    failure.lock().get_or_insert_with(|| err.clone());
                    pump_ended.store(true, Ordering::SeqCst);
                    permit.send(Err(err));
                    break;
                }
                None => {
                    pump_ended.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    });

    reqwest::Body::wrap_stream(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
        if !ended.load(Ordering::SeqCst) {
            yield Err(RelayError::ConsumerDisconnected);
        }
    })
}

/// A buffered upload, handed over in slices so the header wait can see
/// it moving.
fn counted_body(payload: Bytes, progress: Arc<AtomicU64>) -> reqwest::Body {
    let len = payload.len();
    let pieces: Vec<Bytes> = (0..len)
        .step_by(UPLOAD_CHUNK)
        .map(|at| payload.slice(at..(at + UPLOAD_CHUNK).min(len)))
        .collect();
    reqwest::Body::wrap_stream(futures_util::stream::iter(pieces).map(move |piece| {
        progress.fetch_add(piece.len() as u64, Ordering::SeqCst);
        Ok::<Bytes, RelayError>(piece)
    }))
}

/// Body of a peer's response as a channel that keeps the pool lease and
/// the upload alive until it is closed. If the upload side failed, that
/// failure is reported in preference to whatever the peer made of it.
fn response_stream(
    response: Response,
    target: String,
    lease: PoolLease,
    cancel: CancellationToken,
    inbound_failure: FailureSlot,
) -> StreamingBody {
    let upload_guard = cancel.drop_guard();
    StreamingBody::new(async_stream::stream! {
        let _lease = lease;
        let _upload = upload_guard;
        let mut chunks = response.bytes_stream();
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => yield Ok::<Bytes, RelayError>(chunk),
                Err(err) => {
                    let inbound = inbound_failure.lock().take();
                    yield Err(inbound.unwrap_or_else(|| classify(&err, &target)));
                    return;
                }
            }
        }
        let inbound = inbound_failure.lock().take();
        if let Some(err) = inbound {
            yield Err(err);
        }
    })
}

/// Best effort message from an error response: the `message` field of a
/// JSON error body, else its text, else the status reason. A body that
/// stalls for `idle` falls back to the reason.
async fn error_detail(response: Response, idle: Option<Duration>) -> String {
    let reason = response.status().canonical_reason().unwrap_or("error").to_string();
    if response.content_length().is_some_and(|n| n > ERROR_BODY_LIMIT) {
        return reason;
    }

    let mut body = StreamingBody::new(
        response
            .bytes_stream()
            .map(|item| item.map_err(|e| RelayError::aborted(e.to_string()))),
    );
    if let Some(idle) = idle {
        body = body.with_idle_timeout(idle);
    }
    let Ok(bytes) = body.collect_bytes(Some(ERROR_BODY_LIMIT)).await else {
        return reason;
    };

    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if let Some(message) = json.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(&bytes);
    match text.trim() {
        "" => reason,
        text => text.to_string(),
    }
}
