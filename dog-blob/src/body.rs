use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{BlobMetadata, ByteStream, RelayError, RelayResult, TransferMode};

/// How a [`StreamingBody`] ended, reported once through [`StreamingBody::on_close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The consumer read through to the end.
    Completed { bytes: u64 },
    /// The channel yielded an error; nothing follows it.
    Failed { bytes: u64, error: RelayError },
    /// The consumer dropped the channel before the end.
    Abandoned { bytes: u64 },
}

impl CloseOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            CloseOutcome::Completed { bytes }
            | CloseOutcome::Failed { bytes, .. }
            | CloseOutcome::Abandoned { bytes } => *bytes,
        }
    }
}

/// An open, single-consumption, ordered byte channel.
///
/// Dropping the body closes it: every resource captured by the inner
/// stream (store connections, upstream responses, pool permits) is
/// released on the drop, which happens exactly once whichever way the
/// consumer exits. After an error item the channel yields nothing else.
pub struct StreamingBody {
    inner: ByteStream,
}

impl StreamingBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = RelayResult<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self::new(futures_util::stream::once(async move { Ok(bytes) }))
    }

    pub fn empty() -> Self {
        Self::new(futures_util::stream::empty())
    }

    /// Enforce a declared length: ending early is a mid-transfer abort,
    /// running past it is a length mismatch. `None` disables the check.
    pub fn with_length_check(self, expected: Option<u64>) -> Self {
        let Some(expected) = expected else {
            return self;
        };
        let mut inner = self.inner;
        Self::new(async_stream::stream! {
            let mut seen: u64 = 0;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        seen += chunk.len() as u64;
                        if seen > expected {
                            yield Err(RelayError::LengthMismatch { expected, actual: seen });
                            return;
                        }
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if seen < expected {
                yield Err(RelayError::aborted(format!(
                    "channel closed after {seen} of {expected} bytes"
                )));
            }
        })
    }

    /// Fail with a mid-transfer abort when no chunk arrives within `idle`.
    /// The clock only runs while the consumer is waiting on the channel.
    pub fn with_idle_timeout(self, idle: Duration) -> Self {
        let mut inner = self.inner;
        Self::new(async_stream::stream! {
            loop {
                match tokio::time::timeout(idle, inner.next()).await {
                    Ok(Some(Ok(chunk))) => yield Ok(chunk),
                    Ok(Some(Err(e))) => {
                        yield Err(e);
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        yield Err(RelayError::aborted(format!(
                            "no bytes received for {:?}",
                            idle
                        )));
                        return;
                    }
                }
            }
        })
    }

    /// Stop as soon as `token` is cancelled, dropping the inner channel and
    /// yielding [`RelayError::ConsumerDisconnected`] to whoever is reading.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        let mut inner = self.inner;
        Self::new(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    next = inner.next() => Some(next),
                };
                match next {
                    None => {
                        drop(inner);
                        yield Err(RelayError::ConsumerDisconnected);
                        return;
                    }
                    Some(Some(Ok(chunk))) => yield Ok(chunk),
                    Some(Some(Err(e))) => {
                        yield Err(e);
                        return;
                    }
                    Some(None) => return,
                }
            }
        })
    }

    /// Attach context to every error the channel yields.
    pub fn map_err<F>(self, f: F) -> Self
    where
        F: Fn(RelayError) -> RelayError + Send + 'static,
    {
        Self::new(self.inner.map(move |item| item.map_err(&f)))
    }

    /// Run `callback` exactly once when the channel finishes, fails, or is
    /// dropped early.
    pub fn on_close<F>(self, callback: F) -> Self
    where
        F: FnOnce(CloseOutcome) + Send + 'static,
    {
        Self::new(Observed {
            inner: self.inner,
            bytes: 0,
            callback: Some(Box::new(callback)),
        })
    }

    /// Read the whole channel into memory, refusing to hold more than `max`.
    pub async fn collect_bytes(mut self, max: Option<u64>) -> RelayResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk?;
            let size = buf.len() as u64 + chunk.len() as u64;
            if let Some(max) = max {
                if size > max {
                    return Err(RelayError::PayloadTooLarge { size, max });
                }
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Close the channel without reading further.
    pub fn close(self) {
        drop(self);
    }

    pub fn into_byte_stream(self) -> ByteStream {
        self.inner
    }
}

impl Stream for StreamingBody {
    type Item = RelayResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBody").finish_non_exhaustive()
    }
}

type CloseCallback = Box<dyn FnOnce(CloseOutcome) + Send>;

struct Observed {
    inner: ByteStream,
    bytes: u64,
    callback: Option<CloseCallback>,
}

impl Observed {
    fn fire(&mut self, outcome: CloseOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl Stream for Observed {
    type Item = RelayResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        if this.callback.is_none() {
            // already ended
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                let bytes = this.bytes;
                this.fire(CloseOutcome::Failed {
                    bytes,
                    error: error.clone(),
                });
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                let bytes = this.bytes;
                this.fire(CloseOutcome::Completed { bytes });
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for Observed {
    fn drop(&mut self) {
        let bytes = self.bytes;
        self.fire(CloseOutcome::Abandoned { bytes });
    }
}

/// The two ownership modes of an envelope body.
#[derive(Debug)]
pub enum EnvelopeBody {
    /// Exclusively owned open channel; must be read or dropped by one consumer.
    Streaming(StreamingBody),
    /// Fully materialized, immutable bytes.
    Buffered(Bytes),
}

/// Metadata plus body: the unit handed from stage to stage.
#[derive(Debug)]
pub struct TransferEnvelope {
    pub metadata: BlobMetadata,
    pub body: EnvelopeBody,
}

impl TransferEnvelope {
    pub fn streaming(metadata: BlobMetadata, body: StreamingBody) -> Self {
        Self {
            metadata,
            body: EnvelopeBody::Streaming(body),
        }
    }

    /// Buffered envelope; the declared length is the buffer's length.
    pub fn buffered(metadata: BlobMetadata, bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self {
            metadata: metadata.with_content_length(Some(len)),
            body: EnvelopeBody::Buffered(bytes),
        }
    }

    pub fn mode(&self) -> TransferMode {
        match self.body {
            EnvelopeBody::Streaming(_) => TransferMode::Stream,
            EnvelopeBody::Buffered(_) => TransferMode::Buffer,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, EnvelopeBody::Streaming(_))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.metadata.content_length
    }

    /// Materialize the body. A declared length above `max` fails before
    /// any byte is read; a body that disagrees with its declared length
    /// fails once the mismatch is seen.
    pub async fn into_buffered(self, max: Option<u64>) -> RelayResult<TransferEnvelope> {
        let TransferEnvelope { metadata, body } = self;
        match body {
            EnvelopeBody::Buffered(bytes) => Ok(TransferEnvelope::buffered(metadata, bytes)),
            EnvelopeBody::Streaming(stream) => {
                let declared = metadata.content_length;
                if let (Some(size), Some(max)) = (declared, max) {
                    if size > max {
                        stream.close();
                        return Err(RelayError::PayloadTooLarge { size, max });
                    }
                }
                let bytes = stream.with_length_check(declared).collect_bytes(max).await?;
                Ok(TransferEnvelope::buffered(metadata, bytes))
            }
        }
    }

    /// View the body as a channel; buffered bytes become a single chunk.
    pub fn into_streaming(self) -> TransferEnvelope {
        let TransferEnvelope { metadata, body } = self;
        let stream = match body {
            EnvelopeBody::Streaming(stream) => stream,
            EnvelopeBody::Buffered(bytes) => StreamingBody::from_bytes(bytes),
        };
        TransferEnvelope::streaming(metadata, stream)
    }

    /// Same body, new metadata. Hops derive envelopes this way instead of
    /// mutating the one they received.
    pub fn map_metadata<F>(self, f: F) -> TransferEnvelope
    where
        F: FnOnce(BlobMetadata) -> BlobMetadata,
    {
        TransferEnvelope {
            metadata: f(self.metadata),
            body: self.body,
        }
    }

    pub fn into_parts(self) -> (BlobMetadata, EnvelopeBody) {
        (self.metadata, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::{Arc, Mutex};

    fn chunks(parts: &[&'static [u8]]) -> StreamingBody {
        let items: Vec<RelayResult<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        StreamingBody::new(stream::iter(items))
    }

    #[tokio::test]
    async fn length_check_accepts_exact() {
        let body = chunks(&[b"abc", b"de"]).with_length_check(Some(5));
        assert_eq!(body.collect_bytes(None).await.unwrap(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn length_check_flags_short_and_long() {
        let short = chunks(&[b"abc"]).with_length_check(Some(5)).collect_bytes(None).await;
        assert!(matches!(short, Err(RelayError::MidTransferAbort { .. })));

        let long = chunks(&[b"abc", b"def"]).with_length_check(Some(5)).collect_bytes(None).await;
        assert_eq!(long, Err(RelayError::LengthMismatch { expected: 5, actual: 6 }));
    }

    #[tokio::test]
    async fn collect_respects_limit() {
        let res = chunks(&[b"abc", b"def"]).collect_bytes(Some(4)).await;
        assert_eq!(res, Err(RelayError::PayloadTooLarge { size: 6, max: 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_aborts_stalled_channel() {
        let stalled = StreamingBody::new(
            stream::iter(vec![Ok(Bytes::from_static(b"x"))]).chain(stream::pending()),
        )
        .with_idle_timeout(Duration::from_secs(5));

        let res = stalled.collect_bytes(None).await;
        assert!(matches!(res, Err(RelayError::MidTransferAbort { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_channel() {
        let token = CancellationToken::new();
        let mut body = StreamingBody::new(stream::pending()).with_cancellation(token.clone());
        token.cancel();
        assert_eq!(body.next().await, Some(Err(RelayError::ConsumerDisconnected)));
        assert_eq!(body.next().await, None);
    }

    #[tokio::test]
    async fn on_close_fires_once_per_outcome() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let body = chunks(&[b"ab", b"c"]).on_close(move |o| log.lock().unwrap().push(o));
        body.collect_bytes(None).await.unwrap();

        let log = Arc::clone(&seen);
        let mut body = chunks(&[b"ab", b"c"]).on_close(move |o| log.lock().unwrap().push(o));
        body.next().await;
        drop(body);

        let log = Arc::clone(&seen);
        let failing = StreamingBody::new(stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(RelayError::aborted("reset")),
        ]))
        .on_close(move |o| log.lock().unwrap().push(o));
        let _ = failing.collect_bytes(None).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                CloseOutcome::Completed { bytes: 3 },
                CloseOutcome::Abandoned { bytes: 2 },
                CloseOutcome::Failed { bytes: 1, error: RelayError::aborted("reset") },
            ]
        );
    }

    #[tokio::test]
    async fn buffering_checks_declared_length_first() {
        let meta = BlobMetadata::new("big.bin").with_content_length(Some(100));
        let env = TransferEnvelope::streaming(meta, StreamingBody::new(stream::pending()));
        let res = env.into_buffered(Some(10)).await;
        assert!(matches!(res, Err(RelayError::PayloadTooLarge { size: 100, max: 10 })));
    }

    #[tokio::test]
    async fn buffered_envelope_round_trips_to_stream() {
        let env = TransferEnvelope::buffered(BlobMetadata::new("a.txt"), Bytes::from_static(b"hello"));
        assert_eq!(env.content_length(), Some(5));
        assert_eq!(env.mode(), TransferMode::Buffer);

        let streamed = env.into_streaming();
        assert!(streamed.is_streaming());
        let (meta, body) = streamed.into_parts();
        let EnvelopeBody::Streaming(body) = body else {
            panic!("expected streaming body");
        };
        assert_eq!(meta.content_length, Some(5));
        assert_eq!(body.collect_bytes(None).await.unwrap(), Bytes::from_static(b"hello"));
    }
}
