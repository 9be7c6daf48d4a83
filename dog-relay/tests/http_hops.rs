mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use dog_blob::{pattern, BlobStore, EnvelopeBody, Fault, MemoryBlobStore, RelayError, RelayErrorKind, TransferMode};
use dog_relay::{ConnectionPool, HttpBlobStore, HttpHop, PoolConfig, RelayPipeline};
use futures_util::StreamExt;

use common::{dead_addr, memory_source, spawn};

/// Peer that answers a relay with exactly what it was sent.
async fn echo(headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(Body::from_stream(body.into_data_stream()));
    for name in [header::CONTENT_TYPE, header::CONTENT_DISPOSITION, header::CONTENT_LENGTH] {
        if let Some(value) = headers.get(&name) {
            response.headers_mut().insert(name, value.clone());
        }
    }
    response
}

async fn broken(body: Body) -> impl IntoResponse {
    // read the upload so the status is not racing a reset connection
    let _ = axum::body::to_bytes(body, usize::MAX).await;
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"name":"GeneralError","message":"disk on fire","code":500}"#,
    )
}

async fn echo_peer() -> SocketAddr {
    spawn(Router::new().route("/api/files/relay", post(echo))).await
}

fn pool() -> ConnectionPool {
    ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    })
    .unwrap()
}

fn hop(name: &str, addr: SocketAddr, pool: &ConnectionPool) -> HttpHop {
    let url = format!("http://{addr}/api/files/relay").parse().unwrap();
    HttpHop::new(name, url, pool.clone()).with_idle_timeout(Some(Duration::from_secs(5)))
}

async fn read_body(body: EnvelopeBody) -> Result<Vec<u8>, RelayError> {
    match body {
        EnvelopeBody::Buffered(bytes) => Ok(bytes.to_vec()),
        EnvelopeBody::Streaming(stream) => Ok(stream.collect_bytes(None).await?.to_vec()),
    }
}

#[tokio::test]
async fn two_http_hops_deliver_identical_bytes_and_metadata() {
    common::init_tracing();
    let store = Arc::new(MemoryBlobStore::new().with_chunk_size(8192));
    store.insert_generated("photos/x.jpg", 12345, Some("image/jpeg"));
    store.insert_generated("large.bin", 3 << 20, None);
    store.hide_length("large.bin");

    let pool = pool();
    let (a, b) = (echo_peer().await, echo_peer().await);

    for mode in [TransferMode::Stream, TransferMode::Buffer] {
        let pipeline = RelayPipeline::new(memory_source(&store))
            .with_hop(hop("a", a, &pool))
            .with_hop(hop("b", b, &pool))
            .with_mode(mode);

        let envelope = pipeline.run("photos/x.jpg").await.unwrap();
        assert_eq!(envelope.metadata.media_type, "image/jpeg");
        assert_eq!(envelope.metadata.disposition, "attachment; filename=\"x.jpg\"");
        assert_eq!(envelope.content_length(), Some(12345));
        assert_eq!(read_body(envelope.body).await.unwrap(), pattern(12345));

        let envelope = pipeline.run("large.bin").await.unwrap();
        if mode == TransferMode::Stream {
            assert_eq!(envelope.content_length(), None);
        }
        assert_eq!(read_body(envelope.body).await.unwrap(), pattern(3 << 20));
    }

    assert!(store.probe().wait_all_closed(Duration::from_secs(2)).await);
    assert_eq!(pool.available(), pool.config().max_connections);
}

#[tokio::test]
async fn peer_error_status_is_attributed_to_its_hop() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 100_000, None);

    let pool = pool();
    let good = echo_peer().await;
    let bad = spawn(Router::new().route("/api/files/relay", post(broken))).await;

    for mode in [TransferMode::Stream, TransferMode::Buffer] {
        let pipeline = RelayPipeline::new(memory_source(&store))
            .with_hop(hop("good", good, &pool))
            .with_hop(hop("bad", bad, &pool))
            .with_mode(mode);

        let err = pipeline.run("obj").await.unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::UpstreamErrorStatus);
        assert_eq!(err.hop(), Some((2, "bad")));
        assert!(matches!(err.root(), RelayError::UpstreamErrorStatus { status: 500, .. }));
        assert!(err.to_string().contains("disk on fire"), "{err}");
    }

    assert!(store.probe().wait_all_closed(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn unreachable_peer_is_reported_and_source_closed() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 100_000, None);

    let pool = pool();
    let pipeline = RelayPipeline::new(memory_source(&store)).with_hop(hop("gone", dead_addr().await, &pool));

    let err = pipeline.run("obj").await.unwrap_err();
    assert_eq!(err.kind(), RelayErrorKind::UpstreamUnreachable);
    assert_eq!(err.hop(), Some((1, "gone")));
    assert_eq!(err.error_kind().status_code(), 502);
    assert!(store.probe().wait_all_closed(Duration::from_secs(2)).await);
}

/// Accepts connections and never reads or answers on them.
async fn silent_peer() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

fn quick_pool() -> ConnectionPool {
    ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_secs(1),
        ..PoolConfig::default()
    })
    .unwrap()
}

fn quick_hop(name: &str, addr: SocketAddr, pool: &ConnectionPool) -> HttpHop {
    hop(name, addr, pool).with_idle_timeout(Some(Duration::from_secs(1)))
}

#[tokio::test]
async fn peer_that_never_answers_is_unreachable() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 100_000, None);

    let pool = quick_pool();
    let silent = silent_peer().await;

    for mode in [TransferMode::Stream, TransferMode::Buffer] {
        let pipeline = RelayPipeline::new(memory_source(&store))
            .with_hop(quick_hop("silent", silent, &pool))
            .with_mode(mode);

        let err = tokio::time::timeout(Duration::from_secs(8), pipeline.run("obj"))
            .await
            .expect("relay should give up on a silent peer")
            .unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::UpstreamUnreachable, "{mode}: {err}");
        assert_eq!(err.hop(), Some((1, "silent")));
    }

    assert!(store.probe().wait_all_closed(Duration::from_secs(2)).await);
    assert_eq!(pool.available(), pool.config().max_connections);
}

async fn error_with_stalled_body(body: Body) -> Response {
    let _ = axum::body::to_bytes(body, usize::MAX).await;
    let mut response = Response::new(Body::from_stream(
        futures_util::stream::pending::<Result<bytes::Bytes, std::io::Error>>(),
    ));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[tokio::test]
async fn stalled_error_body_still_reports_the_status() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 10_000, None);

    let pool = quick_pool();
    let peer = spawn(Router::new().route("/api/files/relay", post(error_with_stalled_body))).await;

    for mode in [TransferMode::Stream, TransferMode::Buffer] {
        let pipeline = RelayPipeline::new(memory_source(&store))
            .with_hop(quick_hop("mute", peer, &pool))
            .with_mode(mode);

        let err = tokio::time::timeout(Duration::from_secs(8), pipeline.run("obj"))
            .await
            .expect("error body read should be bounded")
            .unwrap_err();
        assert!(matches!(err.root(), RelayError::UpstreamErrorStatus { status: 500, .. }), "{err}");
        assert_eq!(err.hop(), Some((1, "mute")));
        assert!(err.to_string().contains("Internal Server Error"), "{err}");
    }
}

async fn stall_after_first_chunk(body: Body) -> Response {
    let _ = axum::body::to_bytes(body, usize::MAX).await;
    let first = futures_util::stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from(pattern(4096)))]);
    let rest = futures_util::stream::pending::<Result<bytes::Bytes, std::io::Error>>();
    let mut response = Response::new(Body::from_stream(first.chain(rest)));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(10_000u64));
    response
}

#[tokio::test]
async fn response_stalling_mid_body_is_an_abort() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 10_000, None);

    let pool = quick_pool();
    let peer = spawn(Router::new().route("/api/files/relay", post(stall_after_first_chunk))).await;

    for mode in [TransferMode::Stream, TransferMode::Buffer] {
        let pipeline = RelayPipeline::new(memory_source(&store))
            .with_hop(quick_hop("stuck", peer, &pool))
            .with_mode(mode);

        let outcome = tokio::time::timeout(Duration::from_secs(8), async {
            let envelope = pipeline.run("obj").await?;
            read_body(envelope.body).await
        })
        .await
        .expect("stalled body should time out");
        assert_eq!(outcome.unwrap_err().kind(), RelayErrorKind::MidTransferAbort, "{mode}");
    }

    assert_eq!(pool.available(), pool.config().max_connections);
}

#[tokio::test]
async fn streamed_relay_holds_a_slot_per_hop_until_read() {
    let store = Arc::new(MemoryBlobStore::new());
    store.insert_generated("obj", 50_000, None);

    let pool = ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_millis(500),
        max_connections: 2,
        ..PoolConfig::default()
    })
    .unwrap();
    let (a, b) = (echo_peer().await, echo_peer().await);
    let pipeline = RelayPipeline::new(memory_source(&store))
        .with_hop(hop("a", a, &pool))
        .with_hop(hop("b", b, &pool));

    let first = pipeline.run("obj").await.unwrap();
    assert_eq!(pool.available(), 0);

    // a second invocation cannot get a slot while the first is open
    let err = pipeline.run("obj").await.unwrap_err();
    assert_eq!(err.kind(), RelayErrorKind::UpstreamUnreachable);
    assert_eq!(err.hop(), Some((1, "a")));

    assert_eq!(read_body(first.body).await.unwrap(), pattern(50_000));
    assert_eq!(pool.available(), 2);
    assert!(pipeline.run("obj").await.is_ok());
}

#[tokio::test]
async fn dropping_the_terminal_stream_closes_the_store() {
    let store = Arc::new(MemoryBlobStore::new().with_chunk_size(16 * 1024));
    store.insert_generated("huge", 256 << 20, None);

    let pool = pool();
    let pipeline = RelayPipeline::new(memory_source(&store))
        .with_hop(hop("a", echo_peer().await, &pool))
        .with_hop(hop("b", echo_peer().await, &pool));

    let envelope = pipeline.run("huge").await.unwrap();
    let EnvelopeBody::Streaming(mut body) = envelope.body else {
        panic!("expected a streaming body");
    };
    let mut seen = 0;
    while seen < 100_000 {
        seen += body.next().await.unwrap().unwrap().len();
    }
    drop(body);

    assert!(store.probe().wait_all_closed(Duration::from_secs(5)).await);
    assert!(store.probe().bytes_produced() < 256 << 20);
}

#[tokio::test]
async fn source_failure_mid_upload_surfaces_downstream() {
    let store = Arc::new(MemoryBlobStore::new().with_chunk_size(4096));
    store.insert_generated("flaky", 1 << 20, None);
    store.inject_fault("flaky", Fault::FailAfter(200_000));

    let pool = pool();
    let pipeline = RelayPipeline::new(memory_source(&store)).with_hop(hop("a", echo_peer().await, &pool));

    // the peer may answer before or after the upload breaks
    let err = match pipeline.run("flaky").await {
        Ok(envelope) => read_body(envelope.body).await.unwrap_err(),
        Err(err) => err,
    };
    assert_eq!(err.kind(), RelayErrorKind::MidTransferAbort);
    assert!(store.probe().wait_all_closed(Duration::from_secs(2)).await);
}

async fn serve_object(Path(key): Path<String>) -> Response {
    match key.as_str() {
        "docs/report.pdf" => (
            [
                (header::CONTENT_TYPE, "application/pdf"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"Q3 report.pdf\""),
            ],
            pattern(5000),
        )
            .into_response(),
        "boom" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::test]
async fn upstream_store_maps_statuses_and_metadata() {
    let addr = spawn(Router::new().route("/api/files/download/{*key}", get(serve_object))).await;
    let store = HttpBlobStore::parse(&format!("http://{addr}/api/files/download"), pool()).unwrap();

    let opened = store.open("docs/report.pdf").await.unwrap();
    assert_eq!(opened.size_bytes, Some(5000));
    assert_eq!(opened.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(opened.filename.as_deref(), Some("Q3 report.pdf"));
    let mut stream = opened.stream;
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(bytes, pattern(5000));

    assert_eq!(store.open("nope.txt").await.unwrap_err(), RelayError::not_found("nope.txt"));
    assert!(matches!(
        store.open("boom").await.unwrap_err(),
        RelayError::UpstreamErrorStatus { status: 503, .. }
    ));

    let gone = HttpBlobStore::parse(&format!("http://{}/api/files/download", dead_addr().await), pool()).unwrap();
    assert_eq!(gone.open("x").await.unwrap_err().kind(), RelayErrorKind::UpstreamUnreachable);

    let silent = HttpBlobStore::parse(&format!("http://{}/api/files/download", silent_peer().await), quick_pool())
        .unwrap()
        .with_idle_timeout(Some(Duration::from_secs(1)));
    let err = tokio::time::timeout(Duration::from_secs(8), silent.open("x"))
        .await
        .expect("upstream open should be bounded")
        .unwrap_err();
    assert_eq!(err.kind(), RelayErrorKind::UpstreamUnreachable);
}

#[tokio::test]
async fn gateway_over_upstream_store_keeps_display_name() {
    let addr = spawn(Router::new().route("/api/files/download/{*key}", get(serve_object))).await;
    let store = HttpBlobStore::parse(&format!("http://{addr}/api/files/download"), pool()).unwrap();
    let source = dog_blob::BlobSource::new(Arc::new(store), dog_blob::BlobConfig::default());

    let envelope = RelayPipeline::new(source).run("docs/report.pdf").await.unwrap();
    assert_eq!(envelope.metadata.name, "Q3 report.pdf");
    assert_eq!(envelope.metadata.disposition, "attachment; filename=\"Q3 report.pdf\"");
    assert_eq!(envelope.metadata.media_type, "application/pdf");
    assert_eq!(read_body(envelope.body).await.unwrap(), pattern(5000));
}
