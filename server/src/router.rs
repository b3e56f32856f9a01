//! Route table.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{build, chunks, images, proxy, system};
use crate::state::AppState;

/// The Docker API subset plus ferry's own `/_chunks` and `/_contexts` routes.
/// Anything else is forwarded upstream or answered with 501.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/_ping", get(system::ping))
        .route("/session", post(system::session))
        .route("/_chunks", get(chunks::exists).post(chunks::upload))
        .route("/_contexts/{name}", get(chunks::context))
        .route("/{ver}/_ping", get(system::ping))
        .route("/{ver}/version", get(system::version))
        .route("/{ver}/info", get(system::info))
        .route("/{ver}/build", post(build::build))
        .route("/{ver}/build/prune", post(system::build_prune))
        .route("/{ver}/containers/prune", post(system::containers_prune))
        .route("/{ver}/images/json", get(system::images))
        .route("/{ver}/images/create", post(images::pull))
        .route("/{ver}/images/{*rest}", any(images::dispatch))
        .fallback(proxy::forward)
        // Contexts and chunks are larger than the default limit.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
