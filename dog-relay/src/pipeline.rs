use std::fmt;
use std::sync::Arc;

use dog_blob::{BlobSource, CloseOutcome, EnvelopeBody, RelayError, RelayResult, TransferEnvelope, TransferMode};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::RelayHop;

/// Hop index used to attribute failures of the backing-store leg once
/// its channel is already flowing.
pub const SOURCE_INDEX: usize = 0;

/// Lifecycle of one relay invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Sourcing,
    Streaming,
    Buffering,
    Complete,
    Failed,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Complete | RelayState::Failed)
    }

    fn allows(&self, next: RelayState) -> bool {
        use RelayState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Init, Sourcing) => true,
            (Sourcing, Streaming | Buffering) => true,
            // a path can mix modes hop by hop
            (Streaming, Buffering) | (Buffering, Streaming) => true,
            (Streaming, Streaming) | (Buffering, Buffering) => true,
            (Streaming | Buffering, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Init => "INIT",
            RelayState::Sourcing => "SOURCING",
            RelayState::Streaming => "STREAMING",
            RelayState::Buffering => "BUFFERING",
            RelayState::Complete => "COMPLETE",
            RelayState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Shared handle on an invocation's state. The terminal transition may
/// happen long after `run` returned, when the consumer finishes reading.
#[derive(Debug, Clone)]
pub struct RelayTracker {
    relay_id: Uuid,
    state: Arc<Mutex<RelayState>>,
}

impl RelayTracker {
    fn new(relay_id: Uuid) -> Self {
        Self {
            relay_id,
            state: Arc::new(Mutex::new(RelayState::Init)),
        }
    }

    pub fn relay_id(&self) -> Uuid {
        self.relay_id
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock()
    }

    /// Move to `next` if the transition is legal. `FAILED` and
    /// `COMPLETE` are final.
    fn advance(&self, next: RelayState) -> bool {
        let mut state = self.state.lock();
        if !state.allows(next) {
            return false;
        }
        debug!(relay_id = %self.relay_id, from = %*state, to = %next, "relay state");
        *state = next;
        true
    }
}

/// Source plus an ordered list of hops: one end-to-end relay path.
///
/// `run` returns the terminal envelope; the caller owns it from then on.
/// Any failure while building the path drops every envelope opened so
/// far before the error is returned, so no channel outlives a failed
/// invocation.
#[derive(Clone)]
pub struct RelayPipeline {
    source: BlobSource,
    hops: Vec<Arc<dyn RelayHop>>,
    mode: TransferMode,
}

impl RelayPipeline {
    pub fn new(source: BlobSource) -> Self {
        Self {
            source,
            hops: Vec::new(),
            mode: TransferMode::default(),
        }
    }

    pub fn with_hop<H: RelayHop + 'static>(mut self, hop: H) -> Self {
        self.hops.push(Arc::new(hop));
        self
    }

    pub fn with_hops<I>(mut self, hops: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn RelayHop>>,
    {
        self.hops.extend(hops);
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn source(&self) -> &BlobSource {
        &self.source
    }

    pub fn hops(&self) -> &[Arc<dyn RelayHop>] {
        &self.hops
    }

    /// Relay `key` with the pipeline's default mode.
    pub async fn run(&self, key: &str) -> RelayResult<TransferEnvelope> {
        self.run_with_mode(key, self.mode).await
    }

    /// Relay `key` from the backing store through every hop. `mode`
    /// applies to every leg whose hop does not pin its own, and to the
    /// final leg towards the caller.
    pub async fn run_with_mode(&self, key: &str, mode: TransferMode) -> RelayResult<TransferEnvelope> {
        let tracker = RelayTracker::new(Uuid::new_v4());
        let span = info_span!(
            "relay",
            relay_id = %tracker.relay_id(),
            key,
            mode = %mode,
            hops = self.hops.len()
        );

        let result = async {
            info!("relay started");
            tracker.advance(RelayState::Sourcing);

            let envelope = match self.source.fetch_with_mode(key, mode).await {
                Ok(envelope) => envelope,
                Err(err) => return Err(fail(&tracker, err)),
            };
            info!(
                backend = self.source.store().backend(),
                size = ?envelope.content_length(),
                "source opened"
            );
            let envelope = attribute(envelope, SOURCE_INDEX, "source");

            self.finish(envelope, mode, &tracker).await
        }
        .instrument(span.clone())
        .await;

        result.map(|envelope| observe(envelope, tracker, span))
    }

    /// Run an envelope that arrived from a previous hop through this
    /// pipeline's hops. Without hops it comes back unchanged.
    pub async fn relay(&self, envelope: TransferEnvelope, mode: TransferMode) -> RelayResult<TransferEnvelope> {
        let tracker = RelayTracker::new(Uuid::new_v4());
        let span = info_span!(
            "relay",
            relay_id = %tracker.relay_id(),
            name = %envelope.metadata.name,
            mode = %mode,
            hops = self.hops.len()
        );

        let result = async {
            info!(size = ?envelope.content_length(), "relay ingress");
            tracker.advance(RelayState::Sourcing);
            self.finish(envelope, mode, &tracker).await
        }
        .instrument(span.clone())
        .await;

        result.map(|envelope| observe(envelope, tracker, span))
    }

    async fn finish(
        &self,
        mut envelope: TransferEnvelope,
        mode: TransferMode,
        tracker: &RelayTracker,
    ) -> RelayResult<TransferEnvelope> {
        tracker.advance(state_for(envelope.mode()));

        for (i, hop) in self.hops.iter().enumerate() {
            let index = i + 1;
            let hop_mode = hop.mode().unwrap_or(mode);
            tracker.advance(state_for(hop_mode));
            debug!(index, hop = hop.name(), mode = %hop_mode, "forwarding");

            // The hop owns the envelope from here; on error it has
            // already released it.
            envelope = match hop.forward(envelope, hop_mode).await {
                Ok(next) => attribute(next, index, hop.name()),
                Err(err) => return Err(fail(tracker, err.at_hop(index, hop.name()))),
            };
        }

        // Final leg towards the caller.
        if mode == TransferMode::Buffer && envelope.is_streaming() {
            tracker.advance(RelayState::Buffering);
            let max = Some(self.source.config().max_buffered_bytes);
            envelope = match envelope.into_buffered(max).await {
                Ok(buffered) => buffered,
                Err(err) => return Err(fail(tracker, err)),
            };
        }

        Ok(envelope)
    }
}

fn state_for(mode: TransferMode) -> RelayState {
    match mode {
        TransferMode::Stream => RelayState::Streaming,
        TransferMode::Buffer => RelayState::Buffering,
    }
}

fn fail(tracker: &RelayTracker, err: RelayError) -> RelayError {
    tracker.advance(RelayState::Failed);
    match err.hop() {
        Some((index, hop)) => error!(index, hop, error = %err, "relay failed"),
        None => error!(error = %err, "relay failed"),
    }
    err
}

/// Tag errors surfacing later on a streaming body with the leg that
/// produced them. Errors that already carry a hop keep it.
fn attribute(envelope: TransferEnvelope, index: usize, name: &str) -> TransferEnvelope {
    let TransferEnvelope { metadata, body } = envelope;
    match body {
        EnvelopeBody::Streaming(stream) => {
            let name = name.to_string();
            TransferEnvelope::streaming(metadata, stream.map_err(move |e| e.at_hop(index, name.clone())))
        }
        buffered => TransferEnvelope { metadata, body: buffered },
    }
}

/// Attach the end-of-transfer bookkeeping to the envelope handed to the
/// caller.
fn observe(envelope: TransferEnvelope, tracker: RelayTracker, span: Span) -> TransferEnvelope {
    let TransferEnvelope { metadata, body } = envelope;
    match body {
        EnvelopeBody::Buffered(bytes) => {
            span.in_scope(|| info!(bytes = bytes.len(), "relay complete"));
            tracker.advance(RelayState::Complete);
            TransferEnvelope {
                metadata,
                body: EnvelopeBody::Buffered(bytes),
            }
        }
        EnvelopeBody::Streaming(stream) => {
            let stream = stream.on_close(move |outcome| {
                let _entered = span.enter();
                match outcome {
                    CloseOutcome::Completed { bytes } => {
                        tracker.advance(RelayState::Complete);
                        info!(bytes, "relay complete");
                    }
                    CloseOutcome::Abandoned { bytes } => {
                        tracker.advance(RelayState::Failed);
                        warn!(bytes, error = %RelayError::ConsumerDisconnected, "consumer went away mid-stream");
                    }
                    CloseOutcome::Failed { bytes, error } => {
                        tracker.advance(RelayState::Failed);
                        if error.is_consumer_disconnect() {
                            warn!(bytes, %error, "consumer went away mid-stream");
                        } else {
                            error!(bytes, %error, "relay aborted after streaming began");
                        }
                    }
                }
            });
            TransferEnvelope::streaming(metadata, stream)
        }
    }
}
