//! File routes: download, buffered download and relay ingress.
//!
//! ```text
//! GET  /download[/{*key}]        configured mode, `?mode=` overrides
//! GET  /download-bytes[/{*key}]  buffered, always sends Content-Length
//! POST /relay                    body + metadata headers from a previous hop
//! ```

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing, Router,
};
use dog_blob::headers::{metadata_from_headers, FALLBACK_NAME};
use dog_blob::{RelayError, StreamingBody, TransferEnvelope, TransferMode};
use dog_core::errors::DogError;
use futures::StreamExt;
use tracing::debug;

use crate::{params::TransferParams, DogAxumError, DogAxumState, ResponseEmitter};

pub fn file_router(state: DogAxumState) -> Router<()> {
    Router::new()
        .route("/download", routing::get(download_default))
        .route("/download/{*key}", routing::get(download))
        .route("/download-bytes", routing::get(download_bytes_default))
        .route("/download-bytes/{*key}", routing::get(download_bytes))
        .route("/relay", routing::post(relay))
        .with_state(state)
}

async fn download(
    State(state): State<DogAxumState>,
    Path(key): Path<String>,
    Query(query): Query<TransferParams>,
) -> Result<ResponseEmitter, DogAxumError> {
    let mode = query.mode_or(state.pipeline.mode())?;
    emit(&state, &key, mode).await
}

async fn download_default(
    State(state): State<DogAxumState>,
    Query(query): Query<TransferParams>,
) -> Result<ResponseEmitter, DogAxumError> {
    let mode = query.mode_or(state.pipeline.mode())?;
    let key = default_key(&state)?;
    emit(&state, &key, mode).await
}

async fn download_bytes(
    State(state): State<DogAxumState>,
    Path(key): Path<String>,
    Query(query): Query<TransferParams>,
) -> Result<ResponseEmitter, DogAxumError> {
    let mode = query.mode_or(TransferMode::Buffer)?;
    emit(&state, &key, mode).await
}

async fn download_bytes_default(
    State(state): State<DogAxumState>,
    Query(query): Query<TransferParams>,
) -> Result<ResponseEmitter, DogAxumError> {
    let mode = query.mode_or(TransferMode::Buffer)?;
    let key = default_key(&state)?;
    emit(&state, &key, mode).await
}

async fn relay(
    State(state): State<DogAxumState>,
    Query(query): Query<TransferParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<ResponseEmitter, DogAxumError> {
    let mode = query.mode_or(state.pipeline.mode())?;
    let metadata = metadata_from_headers(&headers, FALLBACK_NAME);
    debug!(name = %metadata.name, size = ?metadata.content_length, %mode, "relay ingress");

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|e| RelayError::aborted(format!("request body: {e}"))));
    let mut inbound = StreamingBody::new(stream).with_length_check(metadata.content_length);
    if let Some(idle) = state.pipeline.source().config().idle_timeout {
        inbound = inbound.with_idle_timeout(idle);
    }

    let envelope = state
        .pipeline
        .relay(TransferEnvelope::streaming(metadata, inbound), mode)
        .await?;
    Ok(ResponseEmitter::new(envelope))
}

async fn emit(state: &DogAxumState, key: &str, mode: TransferMode) -> Result<ResponseEmitter, DogAxumError> {
    let envelope = state.pipeline.run_with_mode(key, mode).await?;
    Ok(ResponseEmitter::new(envelope))
}

fn default_key(state: &DogAxumState) -> Result<String, DogAxumError> {
    state
        .default_key
        .as_deref()
        .map(str::to_string)
        .ok_or_else(|| DogError::not_found("No default object key is configured").into())
}
