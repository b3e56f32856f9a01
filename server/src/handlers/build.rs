//! `POST /{ver}/build`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use ferry_core::chunking::MANIFEST_HEADER;
use ferry_core::{ChunkManifest, Frame, OperationRequest, RegistryConfigHeader};
use ferry_runtime::{reconstruct_to_file, spool_to_file, DigestCapture};
use tempfile::NamedTempFile;

use super::{header_str, report, stream_operation};
use crate::error::ApiError;
use crate::params::{BuildParams, QueryParams};
use crate::state::AppState;

/// Build the uploaded context and push the result to the internal registry.
///
/// The body is either the context archive or, with the manifest header, the
/// chunk manifest it is reconstructed from. The stream ends with the image
/// ID as an aux frame.
pub async fn build(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let params = QueryParams::parse(query.as_deref());
    let BuildParams { options, limits } =
        BuildParams::from_query(&params, state.config.resources.build)?;

    let credentials = RegistryConfigHeader(header_str(&headers, "X-Registry-Config").to_string())
        .to_docker_config()
        .map_err(|e| ApiError::from(e).context("extract registry config"))?;

    let spool = receive_context(&state, &headers, body).await?;
    let context = state
        .store
        .put_context_file(spool.path())
        .await
        .map_err(|e| ApiError::from(e).context("store build context"))?;
    drop(spool);

    let context_url = match state
        .store
        .context_url(
            &context,
            &state.config.advertise_url,
            state.config.context_url_ttl(),
        )
        .await
    {
        Ok(url) => url,
        Err(e) => {
            let _ = state.store.delete_context(&context).await;
            return Err(ApiError::from(e).context("sign build context URL"));
        }
    };

    tracing::info!(
        context = %context,
        tags = ?options.tags,
        dockerfile = %options.dockerfile,
        "Starting build"
    );
    let request = OperationRequest::build(options, limits, credentials, context.as_str());

    let deadline = state.config.max_execution_time();
    Ok(stream_operation(deadline, move |sink, cancel| async move {
        let capture = DigestCapture::new(sink);
        let result = state
            .scheduler
            .execute(&request, Some(&context_url), &capture, &cancel)
            .await;

        let succeeded = result.is_ok();
        report(capture.inner(), "execute build", result).await;
        if succeeded {
            let frame = match capture.digest() {
                Some(digest) => Frame::aux_id(digest),
                None => Frame::error("build finished without reporting an image digest"),
            };
            let _ = capture.inner().send(frame).await;
        }

        if let Err(e) = state.store.delete_context(&context).await {
            tracing::warn!(context = %context, error = %e, "Failed to delete build context");
        }
    }))
}

/// Spool the build context to disk, reconstructing it from chunks when the
/// body is a manifest.
async fn receive_context(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<NamedTempFile, ApiError> {
    if !headers.contains_key(MANIFEST_HEADER) {
        return spool_to_file(body.into_data_stream())
            .await
            .map_err(|e| ApiError::from(e).context("receive build context"));
    }

    let encoded = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ApiError::internal(format!("read chunk list: {}", e)))?;
    let manifest = ChunkManifest::decode(&encoded)
        .map_err(|e| ApiError::from(e).context("read chunk list"))?;
    tracing::debug!(chunks = manifest.len(), "Restoring chunked build context");

    reconstruct_to_file(&state.store, &manifest)
        .await
        .map_err(|e| ApiError::from(e).context("restore context"))
}
