//! Image routes: pull, push, tag and inspect.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use ferry_core::image::{is_digest, with_tag};
use ferry_core::{
    DockerConfig, FerryError, Frame, OperationKind, OperationRequest, RegistryAuthHeader,
};
use ferry_runtime::CaptureSink;

use super::{header_str, proxy, report, run_captured, stream_operation};
use crate::error::ApiError;
use crate::params::QueryParams;
use crate::state::AppState;

/// Pull parameters that name features ferry does not offer.
const UNSUPPORTED_PULL: &[(&str, &str)] = &[
    ("repo", "repo"),
    ("fromSrc", "import from a file"),
    ("message", "message"),
    ("platform", "platform"),
];

fn registry_auth(headers: &HeaderMap) -> Result<DockerConfig, ApiError> {
    RegistryAuthHeader(header_str(headers, "X-Registry-Auth").to_string())
        .to_docker_config()
        .map_err(|e| ApiError::from(e).context("extract registry config"))
}

/// `POST /{ver}/images/create?fromImage=&tag=`: copy a remote image into
/// the internal registry.
pub async fn pull(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let params = QueryParams::parse(query.as_deref());
    let from_image = params
        .non_empty("fromImage")
        .ok_or_else(|| ApiError::bad_request("image to pull is missing"))?;
    let tag = params
        .non_empty("tag")
        .ok_or_else(|| ApiError::bad_request("tag to pull is missing"))?;
    for (name, feature) in UNSUPPORTED_PULL {
        if params.non_empty(name).is_some() {
            return Err(FerryError::NotImplemented(feature.to_string()).into());
        }
    }

    let source = if is_digest(tag) {
        format!("{}@{}", from_image, tag)
    } else {
        with_tag(from_image, tag)
    };
    let target = state.registry().image(&source);
    let credentials = registry_auth(&headers)?;

    tracing::info!(source = %source, target = %target, "Pulling image");
    let request = OperationRequest::copy(
        OperationKind::Pull,
        source,
        target,
        state.config.resources.skopeo,
        credentials,
    );
    Ok(stream_copy(state, request, "execute pull"))
}

/// `POST /{ver}/images/{name}/push?tag=`: copy an internal image to its
/// remote registry.
async fn push(state: Arc<AppState>, name: &str, request: Request) -> Result<Response, ApiError> {
    let params = QueryParams::parse(request.uri().query());
    let reference = with_tag(name, params.get("tag").unwrap_or_default());
    let source = state.registry().image(&reference);
    let credentials = registry_auth(request.headers())?;

    tracing::info!(source = %source, target = %reference, "Pushing image");
    let request = OperationRequest::copy(
        OperationKind::Push,
        source,
        reference,
        state.config.resources.skopeo,
        credentials,
    );
    Ok(stream_copy(state, request, "execute push"))
}

fn stream_copy(state: Arc<AppState>, request: OperationRequest, action: &'static str) -> Response {
    let deadline = state.config.max_execution_time();
    stream_operation(deadline, move |sink, cancel| async move {
        let result = state.scheduler.execute(&request, None, &sink, &cancel).await;
        report(&sink, action, result).await;
    })
}

/// `POST /{ver}/images/{name}/tag?repo=&tag=`: copy within the internal
/// registry. A digest name copies the build result with that digest.
async fn tag(state: Arc<AppState>, name: &str, request: Request) -> Result<Response, ApiError> {
    let params = QueryParams::parse(request.uri().query());
    let repo = params
        .non_empty("repo")
        .ok_or_else(|| ApiError::bad_request("repository to tag is missing"))?;
    let source = state.registry().tag_source(name);
    let target = state
        .registry()
        .image(&with_tag(repo, params.get("tag").unwrap_or_default()));

    tracing::info!(source = %source, target = %target, "Tagging image");
    let request = OperationRequest::copy(
        OperationKind::Tag,
        source,
        target,
        state.config.resources.skopeo,
        DockerConfig::default(),
    );

    let (result, output) = run_captured(state, request, CaptureSink::framed()).await;
    match result {
        Ok(_) => Ok((StatusCode::CREATED, output).into_response()),
        Err(e) => {
            tracing::warn!(error = %e, "Tag failed");
            let mut body = BytesMut::from(&output[..]);
            body.extend_from_slice(&Frame::error(format!("execute tag: {}", e)).encode());
            Ok((StatusCode::INTERNAL_SERVER_ERROR, body.freeze()).into_response())
        }
    }
}

/// `GET /{ver}/images/{name}/json`: the image configuration, or 404 when
/// the image cannot be read.
async fn inspect(state: Arc<AppState>, name: &str) -> Result<Response, ApiError> {
    let source = state.registry().image(name);
    let request = OperationRequest::inspect(source, state.config.resources.skopeo);

    let (result, output) = run_captured(state, request, CaptureSink::raw()).await;
    match result {
        Ok(_) => Ok(([(CONTENT_TYPE, "application/json")], output).into_response()),
        Err(e) => {
            tracing::debug!(image = %name, error = %e, "Inspect failed");
            Ok((StatusCode::NOT_FOUND, not_found_body(name, output)).into_response())
        }
    }
}

fn not_found_body(name: &str, output: Bytes) -> Bytes {
    if output.is_empty() {
        Bytes::from(format!("No such image: {}", name))
    } else {
        output
    }
}

/// `/{ver}/images/{*rest}`: image names contain slashes, so the operation
/// is the last path segment. Anything else is forwarded.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path((_version, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    let rest = rest.trim_start_matches('/');
    let method = request.method().clone();

    let result = if method == Method::POST {
        if let Some(name) = rest.strip_suffix("/push") {
            push(state, name, request).await
        } else if let Some(name) = rest.strip_suffix("/tag") {
            tag(state, name, request).await
        } else {
            return proxy::forward(State(state), request).await;
        }
    } else if method == Method::GET {
        match rest.strip_suffix("/json") {
            Some(name) => inspect(state, name).await,
            None => return proxy::forward(State(state), request).await,
        }
    } else {
        return proxy::forward(State(state), request).await;
    };

    result.unwrap_or_else(IntoResponse::into_response)
}
