//! Ping, version, info and the placeholder routes the Docker CLI expects.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ferry_core::{API_VERSION, GIT_COMMIT, VERSION};
use serde_json::{json, Value};

use crate::state::AppState;

/// Oldest API version the Docker CLI may negotiate down to.
const MIN_API_VERSION: &str = "1.12";

/// `GET|HEAD /_ping`
pub async fn ping() -> impl IntoResponse {
    (
        [
            ("Api-Version", API_VERSION),
            ("Docker-Experimental", "false"),
        ],
        "OK",
    )
}

/// `POST /session`: BuildKit session negotiation is not offered.
pub async fn session() -> StatusCode {
    StatusCode::OK
}

/// `GET /{ver}/version`
pub async fn version() -> Json<Value> {
    Json(json!({
        "Version": VERSION,
        "ApiVersion": API_VERSION,
        "MinAPIVersion": MIN_API_VERSION,
        "GitCommit": GIT_COMMIT,
        "Os": "linux",
        "Arch": std::env::consts::ARCH,
        "Components": [{
            "Name": "ferry",
            "Version": VERSION,
            "Details": { "GitCommit": GIT_COMMIT },
        }],
    }))
}

/// `GET /{ver}/info`
pub async fn info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ID": "ferry",
        "Name": "ferry",
        "ServerVersion": VERSION,
        "OperatingSystem": "Kubernetes",
        "OSType": "linux",
        "Architecture": std::env::consts::ARCH,
        "Driver": "ferry",
        "Containers": 0,
        "Images": 0,
        "NCPU": 0,
        "MemTotal": 0,
        "IndexServerAddress": "https://index.docker.io/v1/",
        "RegistryConfig": {
            "InsecureRegistryCIDRs": [],
            "IndexConfigs": {},
            "Mirrors": [],
        },
        "Labels": [
            format!("ferry.registry={}", state.config.registry),
            format!("ferry.namespace={}", state.config.namespace),
        ],
    }))
}

/// `GET /{ver}/images/json`: images live in the registry, not here.
pub async fn images() -> Json<Value> {
    Json(json!([]))
}

/// `POST /{ver}/containers/prune`
pub async fn containers_prune() -> Json<Value> {
    Json(json!({ "ContainersDeleted": [], "SpaceReclaimed": 0 }))
}

/// `POST /{ver}/build/prune`
pub async fn build_prune() -> Json<Value> {
    Json(json!({ "CachesDeleted": [], "SpaceReclaimed": 0 }))
}
