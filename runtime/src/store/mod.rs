//! Content-addressed chunk store.
//!
//! Chunks are stored under `chunks/<hex digest>` and written at most once per
//! key; build contexts are stored as whole archives under
//! `contexts/<name>.tar` and removed once the build that needed them ends.
//! The backend is any [`object_store`] implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ferry_core::config::StoreConfig;
use ferry_core::{ChunkDigest, FerryError, Result};
use futures::stream::{BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use tokio::io::AsyncWriteExt;

const CHUNK_PREFIX: &str = "chunks";
const CONTEXT_PREFIX: &str = "contexts";

fn store_error(err: object_store::Error) -> FerryError {
    FerryError::Store(err.to_string())
}

/// Chunk and context storage on top of an object store.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("store", &self.store.to_string())
            .field("presigned", &self.signer.is_some())
            .finish()
    }
}

impl ChunkStore {
    /// Wrap an existing store. Context URLs are served by ferry itself.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            signer: None,
        }
    }

    /// A store that lives in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build the configured backend.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::Memory => Ok(Self::in_memory()),
            StoreConfig::Filesystem { path } => {
                std::fs::create_dir_all(path).map_err(|e| {
                    FerryError::Config(format!(
                        "Failed to create store directory {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let local = LocalFileSystem::new_with_prefix(path).map_err(store_error)?;
                Ok(Self::new(Arc::new(local)))
            }
            StoreConfig::S3 {
                endpoint,
                bucket,
                region,
                access_key_file,
                secret_key_file,
                allow_http,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_allow_http(*allow_http);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(path) = access_key_file {
                    builder = builder.with_access_key_id(read_key_file(path)?);
                }
                if let Some(path) = secret_key_file {
                    builder = builder.with_secret_access_key(read_key_file(path)?);
                }
                let s3 = Arc::new(builder.build().map_err(store_error)?);
                Ok(Self {
                    store: s3.clone(),
                    signer: Some(s3),
                })
            }
        }
    }

    fn chunk_path(digest: &ChunkDigest) -> StorePath {
        StorePath::from(format!("{}/{}", CHUNK_PREFIX, digest.to_hex()))
    }

    fn context_path(name: &str) -> Result<StorePath> {
        if !is_context_name(name) {
            return Err(FerryError::invalid_parameter(
                "context",
                name,
                "not a context archive name",
            ));
        }
        Ok(StorePath::from(format!("{}/{}", CONTEXT_PREFIX, name)))
    }

    /// Whether a chunk with this digest is stored.
    pub async fn chunk_exists(&self, digest: &ChunkDigest) -> Result<bool> {
        match self.store.head(&Self::chunk_path(digest)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_error(e)),
        }
    }

    /// Store a chunk. The caller guarantees `data` hashes to `digest`.
    pub async fn put_chunk(&self, digest: &ChunkDigest, data: Bytes) -> Result<()> {
        let size = data.len();
        self.store
            .put(&Self::chunk_path(digest), PutPayload::from(data))
            .await
            .map_err(store_error)?;
        tracing::debug!(digest = %digest, size, "Stored chunk");
        Ok(())
    }

    /// Fetch a chunk.
    pub async fn get_chunk(&self, digest: &ChunkDigest) -> Result<Bytes> {
        let result = match self.store.get(&Self::chunk_path(digest)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(FerryError::MissingChunk(digest.to_hex()))
            }
            Err(e) => return Err(store_error(e)),
        };
        result.bytes().await.map_err(store_error)
    }

    /// Upload a local archive as a build context and return its name.
    pub async fn put_context_file(&self, path: &Path) -> Result<String> {
        let name = new_context_name();
        let location = Self::context_path(&name)?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut writer = BufWriter::new(self.store.clone(), location);
        let copied = tokio::io::copy(&mut file, &mut writer).await;
        let size = match copied {
            Ok(size) => size,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(FerryError::Store(format!("upload build context: {}", e)));
            }
        };
        writer
            .shutdown()
            .await
            .map_err(|e| FerryError::Store(format!("complete build context upload: {}", e)))?;

        tracing::info!(context = %name, size, "Stored build context");
        Ok(name)
    }

    /// Stream a stored build context.
    pub async fn open_context(&self, name: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let location = Self::context_path(name)?;
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(FerryError::Store(format!("build context {} not found", name)))
            }
            Err(e) => return Err(store_error(e)),
        };
        Ok(result.into_stream().map(|r| r.map_err(store_error)).boxed())
    }

    /// URL a build pod can fetch the context from.
    ///
    /// Backends that sign URLs hand out a presigned GET; otherwise the pod
    /// downloads through ferry's own `/_contexts/` route.
    pub async fn context_url(&self, name: &str, advertise_url: &str, ttl: Duration) -> Result<String> {
        let location = Self::context_path(name)?;
        match &self.signer {
            Some(signer) => {
                let url = signer
                    .signed_url(http::Method::GET, &location, ttl)
                    .await
                    .map_err(store_error)?;
                Ok(url.to_string())
            }
            None => Ok(format!(
                "{}/_contexts/{}",
                advertise_url.trim_end_matches('/'),
                name
            )),
        }
    }

    /// Remove a build context. Missing contexts are not an error.
    pub async fn delete_context(&self, name: &str) -> Result<()> {
        let location = Self::context_path(name)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }
}

fn read_key_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| FerryError::Config(format!("failed to read {}: {}", path.display(), e)))
}

fn new_context_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}.tar",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        &id[..8]
    )
}

/// Whether `name` can name a context archive: a single path segment ending in `.tar`.
pub fn is_context_name(name: &str) -> bool {
    name.len() > ".tar".len()
        && name.ends_with(".tar")
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}
