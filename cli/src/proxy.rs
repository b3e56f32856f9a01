//! Chunking client proxy.
//!
//! Sits between the Docker CLI and the tunnel to the server. Build requests
//! have their context split into content-defined chunks; chunks the server
//! already holds are skipped, the rest are uploaded to `/_chunks`, and the
//! build is forwarded with the chunk manifest as its body. Every other
//! request passes through unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use ferry_core::chunking::MANIFEST_HEADER;
use ferry_core::{ChunkerConfig, FerryError, Result};
use ferry_runtime::{ChunkUploader, HttpChunkRemote};
use futures::TryStreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Chunking proxy settings.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Chunker parameters; `None` forwards build contexts unchanged.
    pub chunker: Option<ChunkerConfig>,
    /// Chunks checked or uploaded in parallel.
    pub concurrency: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            chunker: Some(ChunkerConfig::default()),
            concurrency: 4,
        }
    }
}

struct ProxyState {
    upstream: Url,
    client: reqwest::Client,
    uploader: Option<ChunkUploader>,
}

fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/{ver}/build", post(build))
        .fallback(forward)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// A running proxy on an ephemeral loopback port.
pub struct ChunkingProxy {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ChunkingProxy {
    /// Start proxying to the Docker API at `upstream`.
    pub async fn start(upstream: SocketAddr, config: ProxyConfig) -> Result<Self> {
        let upstream = Url::parse(&format!("http://{}", upstream))
            .map_err(|e| FerryError::Config(format!("invalid upstream {}: {}", upstream, e)))?;
        let client = reqwest::Client::new();
        let uploader = match config.chunker {
            Some(chunker) => {
                let remote = HttpChunkRemote::new(client.clone(), &upstream)?;
                Some(ChunkUploader::new(Arc::new(remote), chunker).with_concurrency(config.concurrency))
            }
            None => None,
        };
        let state = Arc::new(ProxyState {
            upstream,
            client,
            uploader,
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, create_router(state))
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "Chunking proxy stopped");
            }
        });

        tracing::debug!(address = %local_addr, chunking = config.chunker.is_some(), "Proxy listening");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the proxy and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// `POST /{ver}/build`: replace the context with its chunk manifest.
async fn build(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let Some(uploader) = &state.uploader else {
        return forward(State(state.clone()), request).await;
    };

    let (mut parts, body) = request.into_parts();
    let context = body
        .into_data_stream()
        .map_err(|e| FerryError::Transfer(format!("read build context: {}", e)));
    let summary = match uploader.upload_stream(context).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(error = %e, "Chunked context upload failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upload build context: {}", e),
            )
                .into_response();
        }
    };
    tracing::info!(
        chunks = summary.manifest.len(),
        uploaded = summary.uploaded,
        existing = summary.existing,
        bytes_uploaded = summary.bytes_uploaded,
        "Build context deduplicated"
    );

    parts
        .headers
        .insert(MANIFEST_HEADER, HeaderValue::from_static("1"));
    send(&state, parts, reqwest::Body::from(summary.manifest.encode())).await
}

/// Pass a request through to the server. The request body is buffered.
async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("read request body: {}", e)).into_response()
        }
    };
    send(&state, parts, reqwest::Body::from(body)).await
}

async fn send(state: &ProxyState, mut parts: Parts, body: reqwest::Body) -> Response {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = match state.upstream.join(path_and_query) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid path: {}", e)).into_response(),
    };

    // The body may have been replaced; let the client recompute framing.
    for name in [HOST, CONTENT_LENGTH, TRANSFER_ENCODING] {
        parts.headers.remove(name);
    }

    tracing::debug!(method = %parts.method, url = %url, "Forwarding");
    let response = match state
        .client
        .request(parts.method, url)
        .headers(parts.headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return (StatusCode::BAD_GATEWAY, format!("ferry server: {}", e)).into_response()
        }
    };

    let mut builder = Response::builder().status(response.status());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers().clone());
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}
