use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::data_model::{ChunkMessage, JobId, JobMetadata, JobState};

/// Per-job reassembly state. Chunks may arrive out of order, duplicated,
/// or malformed; contiguous runs are written to a temp sink in index order
/// and completion is detected when every declared chunk has been written.
///
/// A buffer is owned by its registry entry and accessed behind a
/// `tokio::sync::Mutex`, so its methods never interleave for one job.
pub struct ChunkBuffer {
    job_id: JobId,
    metadata: Option<JobMetadata>,
    metadata_json: Option<String>,
    total_chunks: Option<u32>,
    pending: BTreeMap<u32, Bytes>,
    next_index: u32,
    written: u32,
    sink: Option<File>,
    sink_path: Option<PathBuf>,
    state: JobState,
}

impl ChunkBuffer {
    /// Creating the buffer also creates the temp directory; a failure here
    /// propagates and must not leave a registry entry behind.
    pub fn new(job_id: JobId, temp_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(temp_dir).with_context(|| {
            format!(
                "failed to create temp directory {} for job {}",
                temp_dir.display(),
                job_id
            )
        })?;
        Ok(Self {
            sink_path: Some(temp_dir.join(format!("{job_id}_assembled.dat"))),
            job_id,
            metadata: None,
            metadata_json: None,
            total_chunks: None,
            pending: BTreeMap::new(),
            next_index: 0,
            written: 0,
            sink: None,
            state: JobState::Receiving,
        })
    }

    /// Parses job metadata from a first chunk and fixes `total_chunks`.
    /// Returns true when the metadata was initialized by this call; a
    /// non-first chunk or a duplicate first chunk is ignored with a logged
    /// rejection, keeping the original metadata unchanged.
    pub async fn initialize_metadata(&mut self, chunk: &ChunkMessage) -> Result<bool> {
        if !chunk.first_chunk {
            warn!(
                job_id = %self.job_id,
                chunk_id = chunk.chunk_id,
                "metadata initialization attempted with a non-first chunk, ignoring"
            );
            return Ok(false);
        }
        if self.metadata.is_some() {
            warn!(
                job_id = %self.job_id,
                chunk_id = chunk.chunk_id,
                "metadata already initialized, ignoring duplicate first chunk"
            );
            return Ok(false);
        }

        let metadata_json = chunk
            .metadata_json
            .as_deref()
            .ok_or_else(|| anyhow!("first chunk for job {} carries no metadata", self.job_id))?;
        let metadata: JobMetadata = serde_json::from_str(metadata_json).with_context(|| {
            format!("failed to parse job metadata for job {}", self.job_id)
        })?;
        if metadata.requires_iv() && metadata.iv.as_deref().unwrap_or("").is_empty() {
            warn!(
                job_id = %self.job_id,
                mode = %metadata.mode,
                "CBC-family mode declared without an IV, the transform step will reject it"
            );
        }

        self.total_chunks = Some(chunk.total_chunks);
        if chunk.total_chunks > 0 {
            let path = self
                .sink_path
                .clone()
                .ok_or_else(|| anyhow!("assembly sink path missing for job {}", self.job_id))?;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path).await.ok();
            }
            let file = File::create(&path).await.with_context(|| {
                format!("failed to open assembly sink {} for job {}", path.display(), self.job_id)
            })?;
            self.sink = Some(file);
        } else {
            // Metadata-only job: complete immediately, no sink is opened.
            self.sink_path = None;
        }

        info!(
            job_id = %self.job_id,
            total_chunks = chunk.total_chunks,
            file_name = %metadata.file_name,
            operation = %metadata.operation,
            "job metadata initialized"
        );
        self.metadata = Some(metadata);
        self.metadata_json = Some(metadata_json.to_string());
        Ok(true)
    }

    /// Buffers one chunk payload and flushes any contiguous run to the
    /// sink. Out-of-range indices, inconsistent totals, and data for
    /// metadata-only jobs are rejected without corrupting state.
    pub async fn add_chunk_data(&mut self, chunk: &ChunkMessage) -> Result<()> {
        let total = self
            .total_chunks
            .ok_or_else(|| anyhow!("chunk data for job {} before metadata", self.job_id))?;
        if total == 0 {
            warn!(
                job_id = %self.job_id,
                chunk_id = chunk.chunk_id,
                "data chunk received for a metadata-only job, ignoring"
            );
            return Ok(());
        }
        if chunk.total_chunks != total {
            warn!(
                job_id = %self.job_id,
                declared = total,
                received = chunk.total_chunks,
                "chunk declares an inconsistent total chunk count, ignoring"
            );
            return Ok(());
        }
        if chunk.chunk_id >= total {
            warn!(
                job_id = %self.job_id,
                chunk_id = chunk.chunk_id,
                total_chunks = total,
                "chunk index out of range, ignoring"
            );
            return Ok(());
        }
        if chunk.chunk_id < self.next_index {
            // Duplicate of a chunk that was already written; never
            // double-applied.
            warn!(
                job_id = %self.job_id,
                chunk_id = chunk.chunk_id,
                "duplicate delivery of an already written chunk, ignoring"
            );
            return Ok(());
        }

        let payload = chunk.decoded_payload()?;
        self.pending.insert(chunk.chunk_id, payload);
        self.flush_contiguous().await
    }

    async fn flush_contiguous(&mut self) -> Result<()> {
        let total = self.total_chunks.unwrap_or(0);
        while let Some(data) = self.pending.remove(&self.next_index) {
            let sink = self
                .sink
                .as_mut()
                .ok_or_else(|| anyhow!("assembly sink closed for job {}", self.job_id))?;
            sink.write_all(&data)
                .await
                .with_context(|| format!("failed to write chunk for job {}", self.job_id))?;
            self.written += 1;
            self.next_index += 1;
        }
        if self.written == total {
            self.close_sink().await?;
            info!(
                job_id = %self.job_id,
                total_chunks = total,
                "all chunks written, assembly sink closed"
            );
        }
        Ok(())
    }

    async fn close_sink(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()
                .await
                .with_context(|| format!("failed to flush assembly sink for job {}", self.job_id))?;
        }
        Ok(())
    }

    /// Completion is monotonic: metadata initialized and every declared
    /// chunk written (trivially true for metadata-only jobs).
    pub fn is_complete(&self) -> bool {
        match (self.metadata.as_ref(), self.total_chunks) {
            (Some(_), Some(0)) => true,
            (Some(_), Some(total)) => self.written == total,
            _ => false,
        }
    }

    /// Hands the finished artifact to the caller. None for metadata-only
    /// jobs. Idempotently closes the sink if somehow still open.
    pub async fn take_assembled_path(&mut self) -> Result<Option<PathBuf>> {
        if !self.is_complete() {
            return Err(anyhow!(
                "assembly for job {} is not complete, cannot take artifact",
                self.job_id
            ));
        }
        self.close_sink().await?;
        Ok(self.sink_path.clone())
    }

    /// Deletes the temp sink if present. Safe to call multiple times and
    /// after partial failure; a failed deletion is logged, not escalated.
    pub async fn cleanup(&mut self) {
        self.sink = None;
        if let Some(path) = &self.sink_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(job_id = %self.job_id, path = %path.display(), "removed assembly sink"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    job_id = %self.job_id,
                    path = %path.display(),
                    "failed to remove assembly sink: {e}"
                ),
            }
        }
    }

    pub fn metadata(&self) -> Option<&JobMetadata> {
        self.metadata.as_ref()
    }

    /// The raw metadata JSON, base64-encoded for the catalog registration
    /// call.
    pub fn metadata_json_b64(&self) -> Option<String> {
        self.metadata_json.as_ref().map(|m| BASE64.encode(m))
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks.unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn set_state(&mut self, to: JobState) {
        info!(job_id = %self.job_id, from = %self.state, to = %to, "job state transition");
        self.state = to;
    }
}
