//! Chunk dedup endpoints and build context downloads.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use ferry_core::ChunkDigest;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    hash: String,
}

/// `GET /_chunks?hash=`: 200 when the chunk is stored, 404 otherwise.
pub async fn exists(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChunkQuery>,
) -> Result<StatusCode, ApiError> {
    let digest = ChunkDigest::from_hex(&query.hash)?;
    if state.store.chunk_exists(&digest).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// `POST /_chunks?hash=`: store a chunk under its digest. The body must
/// hash to `hash`.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let digest = ChunkDigest::from_hex(&query.hash)?;
    let actual = ChunkDigest::of(&body);
    if actual != digest {
        tracing::warn!(expected = %digest, actual = %actual, "Rejected chunk with mismatching hash");
        return Err(ApiError::bad_request(format!(
            "chunk hash mismatch: expected {}, got {}",
            digest, actual
        )));
    }

    state.store.put_chunk(&digest, body).await?;
    Ok(StatusCode::CREATED)
}

/// `GET /_contexts/{name}`: a stored build context, for build pods when the
/// object store cannot presign URLs.
pub async fn context(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let stream = state.store.open_context(&name).await?;
    Ok(([(CONTENT_TYPE, "application/x-tar")], Body::from_stream(stream)).into_response())
}
