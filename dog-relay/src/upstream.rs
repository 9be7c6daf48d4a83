use std::time::Duration;

use async_trait::async_trait;
use dog_blob::headers::{content_length, filename_from_disposition};
use dog_blob::{BlobStore, OpenedBlob, RelayError, RelayResult};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tracing::warn;

use crate::pool::{classify, ConnectionPool};

/// A backing store that is itself another relay: `open(key)` is a
/// `GET {base}/{key}` against the upstream's download route.
pub struct HttpBlobStore {
    base: Url,
    pool: ConnectionPool,
    idle_timeout: Option<Duration>,
}

impl HttpBlobStore {
    /// `base` is the upstream download route, e.g.
    /// `http://storage:3030/api/files/download`.
    pub fn new(base: Url, pool: ConnectionPool) -> Self {
        Self {
            base,
            pool,
            idle_timeout: Some(dog_blob::DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// Longest wait for the upstream's response headers. `None` waits
    /// forever.
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn parse(base: &str, pool: ConnectionPool) -> RelayResult<Self> {
        let base = Url::parse(base).map_err(|e| RelayError::invalid(format!("bad upstream url {base}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RelayError::invalid(format!("upstream url {base} cannot take a path")));
        }
        Ok(Self::new(base, pool))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `{base}/{key}` with each key segment percent-encoded.
    pub fn object_url(&self, key: &str) -> RelayResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::invalid(format!("upstream url {} cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn open(&self, key: &str) -> RelayResult<OpenedBlob> {
        let url = self.object_url(key)?;
        let lease = self.pool.acquire(&url).await?;

        let request = self.pool.client().get(url.clone()).send();
        let sent = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, request)
                .await
                .map_err(|_| RelayError::unreachable(format!("upstream {url} sent no response within {idle:?}")))?,
            None => request.await,
        };
        let response = sent.map_err(|e| classify(&e, url.as_str()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::not_found(key));
        }
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "upstream store answered with an error");
            return Err(RelayError::error_status(
                status.as_u16(),
                format!("upstream {url} answered {status}"),
            ));
        }

        let headers = response.headers();
        let disposition = header_string(headers, CONTENT_DISPOSITION);
        let filename = disposition.as_deref().and_then(filename_from_disposition);
        let content_type = header_string(headers, CONTENT_TYPE);
        let size = content_length(headers);

        let target = url.to_string();
        let stream = async_stream::stream! {
            let _lease = lease;
            let mut chunks = response.bytes_stream();
            while let Some(item) = chunks.next().await {
                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(err) => {
                        yield Err(classify(&err, &target));
                        return;
                    }
                }
            }
        };

        Ok(OpenedBlob::new(Box::pin(stream))
            .with_size(size)
            .with_content_type(content_type)
            .with_content_disposition(disposition)
            .with_filename(filename))
    }

    fn backend(&self) -> &'static str {
        "upstream"
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}
