use axum::body::Body;
use axum::handler::Handler;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::routes;
use crate::DogAxumState;

/// Router builder for a relay node.
#[derive(Clone)]
pub struct AxumApp {
    pub state: DogAxumState,
    pub router: Router<()>,
}

impl AxumApp {
    pub fn new(state: DogAxumState) -> Self {
        Self {
            state,
            router: Router::new(),
        }
    }

    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub fn r#use(self, path: &str, router: Router<()>) -> Self {
        self.use_router(path, router)
    }

    pub fn use_get<H, T>(mut self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()> + Clone + Send + Sync + 'static,
        T: 'static,
    {
        self.router = self.router.route(path, get(handler));
        self
    }

    pub fn service<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()> + Clone + Send + Sync + 'static,
        T: 'static,
    {
        self.use_get(path, handler)
    }

    /// Mount the download, download-bytes and relay routes under `path`.
    pub fn use_files(self, path: &str) -> Self {
        let router = routes::file_router(self.state.clone());
        self.use_router(path, router)
    }

    /// The finished router: every route gets an `x-request-id` (kept when
    /// the client sent one) and a request span carrying it.
    pub fn into_router(self) -> Router {
        self.router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                info_span!(
                    "http",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id
                )
            }))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

/// Start an app with the file routes at `/api/files` and `GET /health`.
pub fn axum(state: DogAxumState) -> AxumApp {
    AxumApp::new(state)
        .use_files("/api/files")
        .service("/health", || async { "ok" })
}
