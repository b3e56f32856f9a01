//! End-to-end tests of the Docker API router against an in-process cluster
//! and a scripted local runner.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use ferry_core::chunking::MANIFEST_HEADER;
use ferry_core::{ChunkDigest, ChunkManifest, DockerConfig, FerryError, Result, ServerConfig};
use ferry_runtime::{
    ChunkStore, LocalRunner, MemoryCluster, OutputSink, Script, WorkloadPhase,
};
use ferry_server::{create_router, AppState};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const DIGEST: &str = "sha256:d8438874a02b14e2ad7be50f7505ec3d9fe645964e6987101179ef42f8bed5b6";

/// Local runner that records scripts and prints canned output.
#[derive(Default)]
struct RecordingRunner {
    output: Vec<u8>,
    fail: bool,
    calls: Mutex<Vec<(Script, DockerConfig)>>,
}

impl RecordingRunner {
    fn printing(output: &str) -> Self {
        Self {
            output: output.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<(Script, DockerConfig)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalRunner for RecordingRunner {
    async fn run(
        &self,
        script: &Script,
        credentials: &DockerConfig,
        sink: &dyn OutputSink,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((script.clone(), credentials.clone()));
        if !self.output.is_empty() {
            sink.output(&self.output).await?;
        }
        if self.fail {
            return Err(FerryError::LocalExecution("exited with status 1".to_string()));
        }
        Ok(())
    }
}

struct TestApp {
    router: Router,
    cluster: Arc<MemoryCluster>,
    runner: Arc<RecordingRunner>,
    store: ChunkStore,
}

impl TestApp {
    fn new(cluster: MemoryCluster, runner: RecordingRunner) -> Self {
        let config = ServerConfig {
            poll_interval_ms: 5,
            cleanup_timeout_secs: 1,
            ..Default::default()
        };
        let cluster = Arc::new(cluster);
        let runner = Arc::new(runner);
        let store = ChunkStore::in_memory();
        let state = AppState::new(config, cluster.clone(), runner.clone(), store.clone()).unwrap();
        Self {
            router: create_router(state),
            cluster,
            runner,
            store,
        }
    }

    fn plain() -> Self {
        Self::new(MemoryCluster::new(), RecordingRunner::default())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    async fn call(&self, method: Method, uri: &str, body: impl Into<Body>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, String::from_utf8_lossy(&body).into_owned())
    }
}

fn build_logs() -> Vec<String> {
    vec![
        "#1 [internal] load build definition from Dockerfile\n".to_string(),
        format!("#8 exporting manifest {} 0.0s done\n", DIGEST),
    ]
}

#[tokio::test]
async fn test_ping() {
    let app = TestApp::plain();
    for method in [Method::GET, Method::HEAD] {
        let request = Request::builder()
            .method(method)
            .uri("/_ping")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["Api-Version"], "1.40");
        assert_eq!(headers["Docker-Experimental"], "false");
    }
}

#[tokio::test]
async fn test_version_and_placeholders() {
    let app = TestApp::plain();

    let (status, body) = app.call(Method::GET, "/v1.40/version", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let version: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(version["ApiVersion"], "1.40");

    let (status, body) = app.call(Method::GET, "/v1.40/images/json", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "[]");

    let (status, body) = app.call(Method::POST, "/v1.40/build/prune", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("SpaceReclaimed"));

    let (status, _) = app.call(Method::POST, "/session", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route_not_supported() {
    let app = TestApp::plain();
    let (status, body) = app.call(Method::GET, "/v1.40/containers/json", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body, "not supported");
}

#[tokio::test]
async fn test_chunk_dedup_endpoints() {
    let app = TestApp::plain();
    let data = Bytes::from_static(b"some chunk of a build context");
    let hash = ChunkDigest::of(&data).to_hex();
    let uri = format!("/_chunks?hash={}", hash);

    let (status, _) = app.call(Method::GET, &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.call(Method::POST, &uri, data.clone()).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = app.call(Method::GET, &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_chunk_upload_hash_mismatch() {
    let app = TestApp::plain();
    let hash = ChunkDigest::of(b"expected").to_hex();
    let uri = format!("/_chunks?hash={}", hash);

    let (status, body) = app.call(Method::POST, &uri, "something else").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("mismatch"));

    let (status, _) = app.call(Method::GET, &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.call(Method::GET, "/_chunks?hash=zz", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_build_streams_image_id() {
    let app = TestApp::new(
        MemoryCluster::new().with_logs(build_logs()),
        RecordingRunner::default(),
    );
    let (status, body) = app
        .call(
            Method::POST,
            "/v1.40/build?t=myapp:latest&buildargs=%7B%22FOO%22%3A%22bar%22%7D&rm=1",
            "context archive bytes",
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"{"stream":"Creating new pod.\n"}"#));
    assert!(body.ends_with(&format!(r#"{{"aux":{{"ID":"{}"}}}}"#, DIGEST)));

    // Builds never take the local path.
    assert!(app.runner.calls().is_empty());
    assert_eq!(app.cluster.created_pods().len(), 1);
    assert!(app.cluster.created_pods()[0].starts_with("ferry-build-"));
    assert_eq!(app.cluster.deleted_pods(), app.cluster.created_pods());
    assert_eq!(app.cluster.deleted_secrets(), app.cluster.created_secrets());
}

#[tokio::test]
async fn test_build_pod_spec() {
    // Failing deletes keep the pod record around for inspection.
    let app = TestApp::new(
        MemoryCluster::new().with_logs(build_logs()).failing_deletes(),
        RecordingRunner::default(),
    );
    let (status, _) = app
        .call(
            Method::POST,
            "/v1.40/build?t=myapp:latest&buildargs=%7B%22FOO%22%3A%22bar%22%7D",
            "context archive bytes",
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let record = app.cluster.pod(&app.cluster.created_pods()[0]).unwrap();
    let spec = record.pod.spec.unwrap();
    let container = &spec.containers[0];
    let script = &container.args.as_ref().unwrap()[2];
    assert!(script.contains("build-arg:FOO=bar"));
    assert!(script.contains("ferry-registry:5000/images/myapp:latest"));

    let env = container.env.as_ref().unwrap();
    let context_url = env
        .iter()
        .find(|e| e.name == "CONTEXT_URL")
        .and_then(|e| e.value.clone())
        .unwrap();
    assert!(context_url.starts_with("http://ferry:2375/_contexts/"));
}

#[tokio::test]
async fn test_build_rejects_unsupported_parameter() {
    let app = TestApp::plain();
    let (status, body) = app
        .call(Method::POST, "/v1.40/build?cpushares=512", "context")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("cpushares"));
    assert!(body.contains("512"));
    assert!(app.cluster.created_pods().is_empty());
    assert!(app.cluster.created_secrets().is_empty());
}

#[tokio::test]
async fn test_build_failure_streams_error_frame() {
    let app = TestApp::new(
        MemoryCluster::new().with_phases(vec![WorkloadPhase::Pending, WorkloadPhase::Failed]),
        RecordingRunner::default(),
    );
    let (status, body) = app.call(Method::POST, "/v1.40/build", "context").await;

    assert_eq!(status, StatusCode::OK);
    let last = body.rsplit("}{").next().unwrap();
    assert!(last.contains(r#""errorDetail":{"code":1"#));
    assert!(body.contains("execute build"));
    assert!(!body.contains("aux"));
    assert_eq!(app.cluster.deleted_pods().len(), 1);
    assert_eq!(app.cluster.deleted_secrets(), app.cluster.created_secrets());
}

#[tokio::test]
async fn test_chunked_build_context() {
    let app = TestApp::new(
        MemoryCluster::new().with_logs(build_logs()),
        RecordingRunner::default(),
    );

    let pieces = [&b"first chunk "[..], &b"second chunk"[..]];
    let mut manifest = ChunkManifest::new();
    for piece in pieces {
        let digest = ChunkDigest::of(piece);
        let uri = format!("/_chunks?hash={}", digest.to_hex());
        let (status, _) = app.call(Method::POST, &uri, Bytes::copy_from_slice(piece)).await;
        assert_eq!(status, StatusCode::CREATED);
        manifest.push(digest);
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1.40/build?t=app:1")
        .header(MANIFEST_HEADER, "1")
        .body(Body::from(manifest.encode()))
        .unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains(DIGEST));
}

#[tokio::test]
async fn test_chunked_build_with_missing_chunk() {
    let app = TestApp::plain();
    let manifest: ChunkManifest = [ChunkDigest::of(b"never uploaded")].into_iter().collect();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1.40/build")
        .header(MANIFEST_HEADER, "1")
        .body(Body::from(manifest.encode()))
        .unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&body).starts_with("restore context"));
    assert!(app.cluster.created_pods().is_empty());
}

#[tokio::test]
async fn test_pull_validation() {
    let app = TestApp::plain();

    let (status, body) = app
        .call(Method::POST, "/v1.40/images/create?fromImage=alpine", Body::empty())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "tag to pull is missing");

    let (status, body) = app
        .call(
            Method::POST,
            "/v1.40/images/create?fromImage=alpine&tag=3&platform=linux%2Farm64",
            Body::empty(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body, "platform is not supported");
    assert!(app.runner.calls().is_empty());
}

#[tokio::test]
async fn test_pull_copies_into_internal_registry() {
    let app = TestApp::new(MemoryCluster::new(), RecordingRunner::printing("Copying blob\n"));
    let (status, body) = app
        .call(
            Method::POST,
            "/v1.40/images/create?fromImage=localhost%3A5000%2Fapp&tag=1",
            Body::empty(),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"stream":"Copying blob\n"}"#);
    let (script, _) = &app.runner.calls()[0];
    assert!(script.text.contains("docker://localhost:5000/app:1"));
    assert!(script
        .text
        .contains("docker://ferry-registry:5000/images/localhost_5000/app:1"));
}

#[tokio::test]
async fn test_push_uses_registry_auth() {
    let app = TestApp::plain();
    // {"username":"u","password":"p","serveraddress":"reg.example"}
    let auth = "eyJ1c2VybmFtZSI6InUiLCJwYXNzd29yZCI6InAiLCJzZXJ2ZXJhZGRyZXNzIjoicmVnLmV4YW1wbGUifQ==";
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1.40/images/reg.example/team/app/push?tag=2")
        .header("X-Registry-Auth", auth)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);

    let (script, credentials) = &app.runner.calls()[0];
    assert!(script
        .text
        .contains("docker://ferry-registry:5000/images/reg.example/team/app:2"));
    assert!(script.text.contains("docker://reg.example/team/app:2"));
    assert_eq!(
        credentials.to_json(),
        r#"{"auths":{"reg.example":{"auth":"dTpw"}}}"#
    );
}

#[tokio::test]
async fn test_push_failure_streams_error() {
    let app = TestApp::new(MemoryCluster::new(), RecordingRunner::failing());
    let (status, body) = app
        .call(Method::POST, "/v1.40/images/app/push?tag=1", Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""error":"execute push: Local execution failed: exited with status 1""#));
}

#[tokio::test]
async fn test_tag_by_digest() {
    let app = TestApp::plain();
    let uri = format!("/v1.40/images/{}/tag?repo=foo&tag=bar", DIGEST);
    let (status, _) = app.call(Method::POST, &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::CREATED);

    let (script, _) = &app.runner.calls()[0];
    assert!(script
        .text
        .contains(&format!("docker://ferry-registry:5000/digests@{}", DIGEST)));
    assert!(script.text.contains("docker://ferry-registry:5000/images/foo:bar"));
}

#[tokio::test]
async fn test_tag_failure() {
    let app = TestApp::new(MemoryCluster::new(), RecordingRunner::failing());
    let (status, body) = app
        .call(Method::POST, "/v1.40/images/app:1/tag?repo=foo", Body::empty())
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("execute tag"));
}

#[tokio::test]
async fn test_inspect() {
    let app = TestApp::new(
        MemoryCluster::new(),
        RecordingRunner::printing(r#"{"Name":"app","Digest":"sha256:abc"}"#),
    );
    let (status, body) = app.call(Method::GET, "/v1.40/images/app:1/json", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"Name":"app","Digest":"sha256:abc"}"#);

    let (script, credentials) = &app.runner.calls()[0];
    assert!(script.text.contains("docker://ferry-registry:5000/images/app:1"));
    assert!(credentials.is_empty());
}

#[tokio::test]
async fn test_inspect_missing_image() {
    let app = TestApp::new(MemoryCluster::new(), RecordingRunner::failing());
    let (status, body) = app.call(Method::GET, "/v1.40/images/nope/json", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "No such image: nope");
}

#[tokio::test]
async fn test_context_download() {
    let app = TestApp::plain();
    let spool = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(spool.path(), b"tar bytes").unwrap();
    let name = app.store.put_context_file(spool.path()).await.unwrap();

    let (status, body) = app
        .call(Method::GET, &format!("/_contexts/{}", name), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "tar bytes");

    let (status, _) = app.call(Method::GET, "/_contexts/..%2Fchunks", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
