use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{BlobStore, OpenedBlob, RelayError, RelayResult};

/// Default chunk size used when serving objects from memory.
pub const DEFAULT_MEMORY_CHUNK: usize = 64 * 1024;

/// Injected failure for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `open` fails with `BackingStoreUnavailable`.
    Unavailable,
    /// The channel yields an error once `n` bytes were produced.
    FailAfter(u64),
    /// The channel stops producing (but stays open) after `n` bytes.
    StallAfter(u64),
}

#[derive(Debug, Clone)]
enum ObjectData {
    Bytes(Bytes),
    /// `len` bytes of [`pattern_byte`], produced lazily.
    Generated { len: u64 },
}

impl ObjectData {
    fn len(&self) -> u64 {
        match self {
            ObjectData::Bytes(b) => b.len() as u64,
            ObjectData::Generated { len } => *len,
        }
    }

    fn slice(&self, start: u64, end: u64) -> Bytes {
        match self {
            ObjectData::Bytes(b) => b.slice(start as usize..end as usize),
            ObjectData::Generated { .. } => (start..end).map(pattern_byte).collect::<Vec<u8>>().into(),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: ObjectData,
    content_type: Option<String>,
    content_disposition: Option<String>,
    report_length: bool,
    fault: Option<Fault>,
}

/// Byte at `offset` of a generated object.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// The full contents of a generated object of `len` bytes.
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}

/// Counters shared between a [`MemoryBlobStore`] and whoever wants to
/// observe channel lifecycles.
#[derive(Debug, Clone, Default)]
pub struct StoreProbe {
    inner: Arc<ProbeCounters>,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    produced: AtomicU64,
}

impl StoreProbe {
    /// Channels handed out by `open`.
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Channels that were released (read to the end, failed, or dropped).
    pub fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    /// Total bytes produced by all channels so far.
    pub fn bytes_produced(&self) -> u64 {
        self.inner.produced.load(Ordering::SeqCst)
    }

    /// Wait until every opened channel is closed, up to `timeout`.
    pub async fn wait_all_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.open_channels() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn channel(&self) -> ChannelGuard {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        ChannelGuard {
            probe: self.clone(),
        }
    }
}

struct ChannelGuard {
    probe: StoreProbe,
}

impl ChannelGuard {
    fn produced(&self, n: u64) {
        self.probe.inner.produced.fetch_add(n, Ordering::SeqCst);
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.probe.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory backing store for development and testing.
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    probe: StoreProbe,
    chunk_size: usize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            probe: StoreProbe::default(),
            chunk_size: DEFAULT_MEMORY_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn probe(&self) -> StoreProbe {
        self.probe.clone()
    }

    /// Store `data` under `key`.
    pub fn insert<K, D>(&self, key: K, data: D, content_type: Option<&str>)
    where
        K: Into<String>,
        D: Into<Bytes>,
    {
        self.put_object(key.into(), ObjectData::Bytes(data.into()), content_type);
    }

    /// Register a lazily generated object of `len` bytes (see [`pattern`]).
    pub fn insert_generated<K: Into<String>>(&self, key: K, len: u64, content_type: Option<&str>) {
        self.put_object(key.into(), ObjectData::Generated { len }, content_type);
    }

    pub fn set_disposition(&self, key: &str, disposition: &str) {
        if let Some(obj) = self.objects.write().get_mut(key) {
            obj.content_disposition = Some(disposition.to_string());
        }
    }

    /// Serve `key` without announcing its length.
    pub fn hide_length(&self, key: &str) {
        if let Some(obj) = self.objects.write().get_mut(key) {
            obj.report_length = false;
        }
    }

    pub fn inject_fault(&self, key: &str, fault: Fault) {
        if let Some(obj) = self.objects.write().get_mut(key) {
            obj.fault = Some(fault);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects.write().remove(key).is_some()
    }

    fn put_object(&self, key: String, data: ObjectData, content_type: Option<&str>) {
        self.objects.write().insert(
            key,
            MemoryObject {
                data,
                content_type: content_type.map(str::to_string),
                content_disposition: None,
                report_length: true,
                fault: None,
            },
        );
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open(&self, key: &str) -> RelayResult<OpenedBlob> {
        let object = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| RelayError::not_found(key))?;

        if object.fault == Some(Fault::Unavailable) {
            return Err(RelayError::unavailable("memory store marked unavailable"));
        }

        let guard = self.probe.channel();
        let chunk = self.chunk_size as u64;
        let len = object.data.len();
        let fault = object.fault;
        let data = object.data.clone();
        let key_owned = key.to_string();

        let stream = async_stream::stream! {
            let guard = guard;
            let mut offset = 0u64;
            while offset < len {
                let mut end = (offset + chunk).min(len);
                match fault {
                    Some(Fault::FailAfter(n)) if offset >= n => {
                        yield Err(RelayError::aborted(format!(
                            "read of {key_owned} failed at byte {offset}"
                        )));
                        return;
                    }
                    Some(Fault::StallAfter(n)) if offset >= n => {
                        futures_util::future::pending::<()>().await;
                    }
                    Some(Fault::FailAfter(n)) | Some(Fault::StallAfter(n)) if n > offset => {
                        end = end.min(n);
                    }
                    _ => {}
                }
                let bytes = data.slice(offset, end);
                guard.produced(bytes.len() as u64);
                offset = end;
                yield Ok(bytes);
            }
        };

        Ok(OpenedBlob::new(Box::pin(stream))
            .with_size(object.report_length.then_some(len))
            .with_content_type(object.content_type)
            .with_content_disposition(object.content_disposition))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
