//! Chunk deduplication.
//!
//! A [`ChunkUploader`] splits a byte stream into content-defined chunks and
//! makes sure every chunk exists on a [`ChunkRemote`], uploading only those
//! the remote does not already hold. The resulting [`ChunkManifest`] lists
//! the chunk digests in stream order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ferry_core::{ChunkDigest, ChunkManifest, Chunker, ChunkerConfig, FerryError, Result};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use url::Url;

use crate::store::ChunkStore;

/// Where chunks are checked and uploaded.
#[async_trait]
pub trait ChunkRemote: Send + Sync {
    /// Whether the remote already holds the chunk.
    async fn exists(&self, digest: &ChunkDigest) -> Result<bool>;

    /// Upload a chunk.
    async fn upload(&self, digest: &ChunkDigest, data: Bytes) -> Result<()>;
}

#[async_trait]
impl ChunkRemote for ChunkStore {
    async fn exists(&self, digest: &ChunkDigest) -> Result<bool> {
        self.chunk_exists(digest).await
    }

    async fn upload(&self, digest: &ChunkDigest, data: Bytes) -> Result<()> {
        self.put_chunk(digest, data).await
    }
}

/// A ferry server's `/_chunks` endpoint.
#[derive(Debug, Clone)]
pub struct HttpChunkRemote {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpChunkRemote {
    /// `base` is the server root, e.g. `http://127.0.0.1:2375`.
    pub fn new(client: reqwest::Client, base: &Url) -> Result<Self> {
        let endpoint = base
            .join("/_chunks")
            .map_err(|e| FerryError::Config(format!("invalid server URL {}: {}", base, e)))?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, digest: &ChunkDigest) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("hash", &digest.to_hex());
        url
    }
}

#[async_trait]
impl ChunkRemote for HttpChunkRemote {
    async fn exists(&self, digest: &ChunkDigest) -> Result<bool> {
        let response = self
            .client
            .get(self.url(digest))
            .send()
            .await
            .map_err(|e| FerryError::Transfer(format!("check chunk {}: {}", digest, e)))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(FerryError::Transfer(format!(
                "check chunk {}: unexpected status {}",
                digest, status
            ))),
        }
    }

    async fn upload(&self, digest: &ChunkDigest, data: Bytes) -> Result<()> {
        let response = self
            .client
            .post(self.url(digest))
            .body(data)
            .send()
            .await
            .map_err(|e| FerryError::Transfer(format!("upload chunk {}: {}", digest, e)))?;

        if !response.status().is_success() {
            return Err(FerryError::Transfer(format!(
                "upload chunk {}: unexpected status {}",
                digest,
                response.status()
            )));
        }
        Ok(())
    }
}

/// What [`ChunkUploader::ensure`] did for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The remote already held the chunk.
    Existing,
    /// This call uploaded the chunk.
    Uploaded,
}

/// Result of uploading one stream.
#[derive(Debug, Clone, Default)]
pub struct UploadSummary {
    pub manifest: ChunkManifest,
    pub uploaded: usize,
    pub existing: usize,
    pub bytes_uploaded: u64,
}

/// Deduplicating chunk uploader.
///
/// Checks and uploads for one digest are serialized by a per-digest lock, so
/// identical chunks arriving concurrently are uploaded once.
pub struct ChunkUploader {
    remote: Arc<dyn ChunkRemote>,
    config: ChunkerConfig,
    concurrency: usize,
    locks: DashMap<ChunkDigest, Arc<tokio::sync::Mutex<()>>>,
    uploaded_bytes: AtomicU64,
}

impl ChunkUploader {
    pub fn new(remote: Arc<dyn ChunkRemote>, config: ChunkerConfig) -> Self {
        Self {
            remote,
            config,
            concurrency: 4,
            locks: DashMap::new(),
            uploaded_bytes: AtomicU64::new(0),
        }
    }

    /// Number of chunks checked or uploaded in parallel for one stream.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Total bytes this uploader has sent.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    /// Make sure one chunk exists on the remote.
    pub async fn ensure(&self, data: Bytes) -> Result<(ChunkDigest, ChunkOutcome)> {
        let digest = ChunkDigest::of(&data);
        let lock = self.locks.entry(digest).or_default().clone();
        let _guard = lock.lock().await;

        if self.remote.exists(&digest).await? {
            tracing::trace!(digest = %digest, "Chunk already stored");
            return Ok((digest, ChunkOutcome::Existing));
        }

        let size = data.len() as u64;
        self.remote.upload(&digest, data).await?;
        self.uploaded_bytes.fetch_add(size, Ordering::Relaxed);
        tracing::debug!(digest = %digest, size, "Uploaded chunk");
        Ok((digest, ChunkOutcome::Uploaded))
    }

    /// Chunk `body`, upload what is missing, and return the manifest.
    ///
    /// Any failed check or upload aborts the whole stream.
    pub async fn upload_stream<S>(&self, body: S) -> Result<UploadSummary>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let outcomes: Vec<(ChunkDigest, ChunkOutcome, u64)> = chunk_stream(body, self.config)
            .map_ok(|chunk| async move {
                let size = chunk.len() as u64;
                let (digest, outcome) = self.ensure(chunk).await?;
                Ok::<_, FerryError>((digest, outcome, size))
            })
            .try_buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut summary = UploadSummary::default();
        for (digest, outcome, size) in outcomes {
            summary.manifest.push(digest);
            match outcome {
                ChunkOutcome::Existing => summary.existing += 1,
                ChunkOutcome::Uploaded => {
                    summary.uploaded += 1;
                    summary.bytes_uploaded += size;
                }
            }
        }
        Ok(summary)
    }
}

/// Split a byte stream into content-defined chunks.
pub fn chunk_stream<S>(body: S, config: ChunkerConfig) -> impl Stream<Item = Result<Bytes>>
where
    S: Stream<Item = Result<Bytes>>,
{
    try_stream! {
        let mut chunker = Chunker::new(config)?;
        futures::pin_mut!(body);
        while let Some(piece) = body.next().await {
            let piece = piece?;
            for chunk in chunker.feed(&piece) {
                yield chunk;
            }
        }
        if let Some(last) = chunker.finish() {
            yield last;
        }
    }
}
