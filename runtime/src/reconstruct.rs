//! Build context reconstruction.
//!
//! Replays a [`ChunkManifest`] against the [`ChunkStore`] into a spooled
//! temporary file, so large contexts never have to fit in memory.

use bytes::Bytes;
use ferry_core::{ChunkManifest, FerryError, Result};
use futures::{Stream, StreamExt, TryStreamExt};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::store::ChunkStore;

/// Chunks fetched ahead of the writer.
const PREFETCH: usize = 4;

/// Write the chunks named by `manifest`, in order, to `out`.
///
/// Returns the number of bytes written. A missing chunk aborts with
/// [`FerryError::MissingChunk`].
pub async fn reconstruct<W>(store: &ChunkStore, manifest: &ChunkManifest, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut chunks = futures::stream::iter(manifest.digests().iter().copied())
        .map(|digest| async move { store.get_chunk(&digest).await })
        .buffered(PREFETCH);

    let mut written = 0u64;
    while let Some(chunk) = chunks.try_next().await? {
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;

    tracing::debug!(chunks = manifest.len(), bytes = written, "Reconstructed build context");
    Ok(written)
}

/// Reconstruct a context into a new temporary file.
pub async fn reconstruct_to_file(store: &ChunkStore, manifest: &ChunkManifest) -> Result<NamedTempFile> {
    let spool = NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(spool.reopen()?);
    reconstruct(store, manifest, &mut file).await?;
    Ok(spool)
}

/// Spool a plain request body into a new temporary file.
pub async fn spool_to_file<S, E>(body: S) -> Result<NamedTempFile>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let spool = NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(spool.reopen()?);

    futures::pin_mut!(body);
    while let Some(piece) = body.next().await {
        let piece = piece.map_err(|e| FerryError::Transfer(format!("read request body: {}", e)))?;
        file.write_all(&piece).await?;
    }
    file.flush().await?;
    Ok(spool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::ChunkDigest;

    async fn store_with(chunks: &[&'static [u8]]) -> (ChunkStore, ChunkManifest) {
        let store = ChunkStore::in_memory();
        let mut manifest = ChunkManifest::new();
        for chunk in chunks {
            let digest = ChunkDigest::of(chunk);
            store
                .put_chunk(&digest, Bytes::from_static(chunk))
                .await
                .unwrap();
            manifest.push(digest);
        }
        (store, manifest)
    }

    #[tokio::test]
    async fn test_reconstruct_in_manifest_order() {
        let (store, manifest) = store_with(&[b"alpha ", b"beta ", b"alpha "]).await;
        let mut out = Vec::new();
        let written = reconstruct(&store, &manifest, &mut out).await.unwrap();
        assert_eq!(out, b"alpha beta alpha ");
        assert_eq!(written, 17);
    }

    #[tokio::test]
    async fn test_missing_chunk_aborts() {
        let (store, mut manifest) = store_with(&[b"present"]).await;
        manifest.push(ChunkDigest::of(b"absent"));
        let mut out = Vec::new();
        let err = reconstruct(&store, &manifest, &mut out).await.unwrap_err();
        assert!(matches!(err, FerryError::MissingChunk(_)));
    }

    #[tokio::test]
    async fn test_empty_manifest_is_empty_context() {
        let store = ChunkStore::in_memory();
        let file = reconstruct_to_file(&store, &ChunkManifest::new()).await.unwrap();
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_reconstruct_to_file() {
        let (store, manifest) = store_with(&[b"FROM scratch\n", b"COPY . /\n"]).await;
        let file = reconstruct_to_file(&store, &manifest).await.unwrap();
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            b"FROM scratch\nCOPY . /\n"
        );
    }

    #[tokio::test]
    async fn test_spool_plain_body() {
        let body = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"part one, ")),
            Ok(Bytes::from_static(b"part two")),
        ]);
        let file = spool_to_file(body).await.unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"part one, part two");
    }
}
