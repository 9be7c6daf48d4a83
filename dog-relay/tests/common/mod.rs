#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dog_blob::{
    BlobConfig, BlobSource, EnvelopeBody, MemoryBlobStore, RelayError, RelayResult, TransferEnvelope, TransferMode,
};
use dog_relay::RelayHop;
use parking_lot::Mutex;

/// Counts what a scripted hop did with the channels it handled.
#[derive(Debug, Clone, Default)]
pub struct HopProbe {
    forwarded: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    modes: Arc<Mutex<Vec<TransferMode>>>,
}

impl HopProbe {
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<TransferMode> {
        self.modes.lock().clone()
    }
}

/// Forwards the envelope unchanged, honoring the requested mode.
pub struct PassThroughHop {
    pub name: String,
    pub pinned: Option<TransferMode>,
    pub probe: HopProbe,
}

impl PassThroughHop {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pinned: None,
            probe: HopProbe::default(),
        }
    }

    pub fn pinned(mut self, mode: TransferMode) -> Self {
        self.pinned = Some(mode);
        self
    }
}

#[async_trait]
impl RelayHop for PassThroughHop {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> Option<TransferMode> {
        self.pinned
    }

    async fn forward(&self, envelope: TransferEnvelope, mode: TransferMode) -> RelayResult<TransferEnvelope> {
        self.probe.forwarded.fetch_add(1, Ordering::SeqCst);
        self.probe.modes.lock().push(mode);

        match mode {
            TransferMode::Buffer => envelope.into_buffered(None).await,
            TransferMode::Stream => {
                let (metadata, body) = envelope.into_streaming().into_parts();
                let EnvelopeBody::Streaming(stream) = body else {
                    unreachable!("into_streaming always yields a channel");
                };
                self.probe.opened.fetch_add(1, Ordering::SeqCst);
                let closed = self.probe.closed.clone();
                let stream = stream.on_close(move |_| {
                    closed.fetch_add(1, Ordering::SeqCst);
                });
                Ok(TransferEnvelope::streaming(metadata, stream))
            }
        }
    }
}

/// Drops whatever it receives and reports an upstream error status.
pub struct FailingHop {
    pub name: String,
    pub status: u16,
    pub probe: HopProbe,
}

impl FailingHop {
    pub fn new(name: &str, status: u16) -> Self {
        Self {
            name: name.to_string(),
            status,
            probe: HopProbe::default(),
        }
    }
}

#[async_trait]
impl RelayHop for FailingHop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, envelope: TransferEnvelope, _mode: TransferMode) -> RelayResult<TransferEnvelope> {
        self.probe.forwarded.fetch_add(1, Ordering::SeqCst);
        drop(envelope);
        Err(RelayError::error_status(self.status, "scripted failure"))
    }
}

pub fn memory_source(store: &Arc<MemoryBlobStore>) -> BlobSource {
    BlobSource::new(store.clone(), BlobConfig::default())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serve `router` on an ephemeral local port.
pub async fn spawn(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
