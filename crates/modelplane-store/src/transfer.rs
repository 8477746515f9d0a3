//! Sequential chunk transfer between memory and the document store
//!
//! Chunk writes and reads run with exactly one operation outstanding and are
//! issued in chunk-number order.

use futures::stream::{self, StreamExt, TryStreamExt};
use modelplane_core::{ModelChunk, ModelPlaneError, ModelPlaneResult};
use tracing::{debug, info, warn};

use crate::chunk;
use crate::repository::ModelRepository;

/// Outstanding chunk operations per transfer
pub const CHUNK_IO_CONCURRENCY: usize = 1;

/// Moves chunked model content in and out of the repository
#[derive(Clone)]
pub struct ChunkTransfer {
    repo: ModelRepository,
    max_size: u64,
}

impl ChunkTransfer {
    pub fn new(repo: ModelRepository, max_size: u64) -> Self {
        Self { repo, max_size }
    }

    /// Persist chunks in order; returns the number written.
    ///
    /// A chunk that would push the running total over the size limit is
    /// rejected before it is committed. On any failure every chunk already
    /// written for `model_id` is deleted and the original error returned.
    pub async fn upload(&self, model_id: &str, chunks: Vec<Vec<u8>>) -> ModelPlaneResult<u32> {
        let total = chunks.len() as u32;
        let max_size = self.max_size;

        let mut running = 0u64;
        let jobs = chunks.into_iter().enumerate().map(|(number, bytes)| {
            running += bytes.len() as u64;
            (number as u32, bytes, running)
        });

        let mut writes = stream::iter(jobs)
            .map(|(number, bytes, running)| async move {
                if running > max_size {
                    return Err(ModelPlaneError::SizeLimitExceeded {
                        size: running,
                        limit: max_size,
                    });
                }
                self.repo
                    .put_chunk(&ModelChunk::new(model_id, number, bytes))
                    .await?;
                debug!(model_id = model_id, chunk = number, total = total, "Wrote chunk");
                Ok(number)
            })
            .buffered(CHUNK_IO_CONCURRENCY);

        let mut written = 0u32;
        while let Some(result) = writes.next().await {
            match result {
                Ok(_) => written += 1,
                Err(e) => {
                    drop(writes);
                    warn!(model_id = model_id, written = written, error = %e, "Chunk upload failed");
                    self.discard(model_id).await;
                    return Err(e);
                }
            }
        }

        info!(model_id = model_id, chunks = written, "Uploaded model chunks");
        Ok(written)
    }

    /// Read `total_chunks` chunks in order and reassemble them.
    ///
    /// Returns the content with its digest; merge and hashing run on the
    /// blocking pool.
    pub async fn download(
        &self,
        model_id: &str,
        total_chunks: u32,
    ) -> ModelPlaneResult<(Vec<u8>, String)> {
        let chunks: Vec<(u32, Vec<u8>)> = stream::iter(0..total_chunks)
            .map(|number| async move {
                let chunk = self.repo.get_chunk(model_id, number).await?;
                Ok::<_, ModelPlaneError>((number, chunk.content))
            })
            .buffered(CHUNK_IO_CONCURRENCY)
            .try_collect()
            .await?;

        let (content, digest) = tokio::task::spawn_blocking(move || {
            let content = chunk::merge(total_chunks, chunks)?;
            let digest = chunk::digest(&content);
            Ok::<_, ModelPlaneError>((content, digest))
        })
        .await
        .map_err(|e| ModelPlaneError::Internal(format!("chunk merge task failed: {}", e)))??;

        debug!(model_id = model_id, size = content.len(), "Reassembled model content");
        Ok((content, digest))
    }

    /// Best-effort removal of a model's chunks
    pub async fn discard(&self, model_id: &str) {
        match self.repo.delete_chunks(model_id).await {
            Ok(removed) => debug!(model_id = model_id, removed = removed, "Discarded chunks"),
            Err(e) => warn!(model_id = model_id, error = %e, "Failed to discard chunks"),
        }
    }
}
