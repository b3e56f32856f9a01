//! Routes ferry does not implement.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Forward the request to the upstream daemon, or answer 501 when none is
/// configured. The request body is buffered; the response is streamed.
pub async fn forward(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let Some(upstream) = &state.upstream else {
        tracing::debug!(method = %request.method(), path = %request.uri().path(), "Unsupported route");
        return (StatusCode::NOT_IMPLEMENTED, "not supported").into_response();
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = match upstream.base.join(path_and_query) {
        Ok(url) => url,
        Err(e) => return ApiError::bad_request(format!("invalid path: {}", e)).into_response(),
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return ApiError::internal(format!("read request body: {}", e)).into_response(),
    };

    let mut headers = parts.headers;
    headers.remove(HOST);

    tracing::debug!(method = %parts.method, url = %url, "Forwarding to upstream");
    let response = match upstream
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return ApiError::new(StatusCode::BAD_GATEWAY, format!("upstream: {}", e))
                .into_response()
        }
    };

    let mut builder = Response::builder().status(response.status());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers().clone());
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|e| ApiError::internal(e.to_string()).into_response())
}
