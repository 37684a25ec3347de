use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{error, info, warn};

use crate::{
    catalog::{CatalogApi, InitiateUploadRequest},
    config::ProcessingConfig,
    data_model::{
        mime_type_for, ArtifactId, ChunkMessage, JobId, JobMetadata, JobState, JobStatus,
        NotificationEvent,
    },
    ingest::JobRegistry,
    metrics::Metrics,
    notify::NotificationRouter,
    processor::{
        transform::{TransformOutcome, TransformRunner},
        WorkerPool,
    },
};

/// One assembled job handed to the worker pool. The input file is owned by
/// the job from this point; the orchestrator deletes it on every terminal
/// edge.
pub struct ProcessingJob {
    pub job_id: JobId,
    pub metadata: JobMetadata,
    pub input_path: PathBuf,
}

/// Drives every job through its lifecycle: registration with the catalog
/// on the first chunk, reassembly via the registry, transform execution on
/// a worker, upload of the processed artifact, and exactly one terminal
/// report (status update, notification, temp file cleanup) per job.
pub struct JobOrchestrator {
    registry: JobRegistry,
    catalog: Arc<dyn CatalogApi>,
    notifications: Arc<NotificationRouter>,
    transform: TransformRunner,
    temp_dir: PathBuf,
    upload_chunk_size: usize,
    // The pool holds an Arc back to the orchestrator, so it is attached
    // after construction.
    worker_pool: OnceLock<WorkerPool>,
    metrics: Arc<Metrics>,
}

impl JobOrchestrator {
    pub fn new(
        config: &ProcessingConfig,
        catalog: Arc<dyn CatalogApi>,
        notifications: Arc<NotificationRouter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry: JobRegistry::new(config.temp_dir.clone()),
            catalog,
            notifications,
            transform: TransformRunner::new(
                config.transform_executable.clone(),
                config.watchdog_timeout(),
            ),
            temp_dir: config.temp_dir.clone(),
            upload_chunk_size: config.upload_chunk_size_bytes,
            worker_pool: OnceLock::new(),
            metrics,
        }
    }

    pub fn attach_worker_pool(&self, pool: WorkerPool) {
        if self.worker_pool.set(pool).is_err() {
            warn!("worker pool already attached, ignoring");
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Entry point for every broker delivery. An `Err` from here means the
    /// message could not be applied and the consumer dead-letters it and
    /// force-fails the job.
    pub async fn handle_chunk(&self, message: ChunkMessage) -> Result<()> {
        let job_id = JobId::from(message.job_id.as_str());
        if !job_id.is_path_safe() {
            return Err(anyhow!(
                "job id {job_id:?} is not usable as a path component"
            ));
        }
        let buffer = self.registry.get_or_create(&job_id)?;

        let completed = {
            let mut buffer = buffer.lock().await;

            if message.first_chunk {
                let initialized = buffer.initialize_metadata(&message).await?;
                if initialized {
                    buffer.set_state(JobState::Registering);
                    let metadata = buffer
                        .metadata()
                        .cloned()
                        .ok_or_else(|| anyhow!("metadata missing after initialization"))?;
                    if let Err(e) = self
                        .catalog
                        .create_job_record(
                            &job_id,
                            &metadata.file_name,
                            &metadata.operation.as_upper(),
                            &metadata.mode,
                        )
                        .await
                    {
                        error!(job_id = %job_id, "catalog registration failed: {e:#}");
                        buffer.set_state(JobState::Error);
                        drop(buffer);
                        self.force_fail(&job_id, "Failed to register the job with the catalog")
                            .await;
                        return Ok(());
                    }
                    // Record of the original payload, best effort.
                    let source_record = InitiateUploadRequest {
                        job_id: job_id.clone(),
                        original_file_name: metadata.file_name.clone(),
                        operation_type: metadata.operation.as_upper(),
                        mime_type: mime_type_for(&metadata.file_name).to_string(),
                        total_chunks: buffer.total_chunks(),
                        file_size: metadata.original_file_size,
                        metadata_json_base64: buffer.metadata_json_b64(),
                    };
                    if let Err(e) = self.catalog.initiate_chunked_upload(source_record).await {
                        warn!(job_id = %job_id, "failed to record original payload upload: {e:#}");
                    }
                    buffer.set_state(JobState::Assembling);
                }
            }

            if message.has_payload() || !message.first_chunk {
                buffer.add_chunk_data(&message).await?;
            }

            if buffer.is_complete() {
                // Evict before releasing the lock so no later delivery can
                // observe the finished buffer.
                self.registry.remove(&job_id);
                let input_path = buffer.take_assembled_path().await?;
                let metadata = buffer
                    .metadata()
                    .cloned()
                    .ok_or_else(|| anyhow!("metadata missing for completed job"))?;
                Some((input_path, metadata))
            } else {
                None
            }
        };

        if let Some((input_path, metadata)) = completed {
            match input_path {
                Some(input_path) => {
                    info!(job_id = %job_id, "assembly complete, dispatching to worker pool");
                    let submitted = match self.worker_pool.get() {
                        Some(pool) => pool.submit(ProcessingJob {
                            job_id: job_id.clone(),
                            metadata,
                            input_path: input_path.clone(),
                        }),
                        None => Err(anyhow!("worker pool not attached")),
                    };
                    if let Err(e) = submitted {
                        // no worker will ever own this input, remove it here
                        if let Err(remove_err) = tokio::fs::remove_file(&input_path).await {
                            warn!(
                                job_id = %job_id,
                                path = %input_path.display(),
                                "failed to remove input file: {remove_err}"
                            );
                        }
                        return Err(e);
                    }
                }
                None => {
                    // Metadata-only job, nothing to transform or upload.
                    info!(job_id = %job_id, "metadata-only job complete");
                    self.report_done(&job_id, None).await;
                }
            }
        }
        Ok(())
    }

    /// Executed on a pool worker. Every exit path reports exactly one
    /// terminal outcome and removes the job's temp files.
    pub async fn run_processing(&self, job: ProcessingJob) {
        let job_id = job.job_id.clone();
        info!(job_id = %job_id, from = %JobState::Assembling, to = %JobState::Processing, "job state transition");
        self.notifications
            .publish(NotificationEvent::running(job_id.clone()))
            .await;

        let output_dir = self.temp_dir.join(job_id.get());
        match self.process_and_upload(&job, &output_dir).await {
            Ok(artifact_id) => self.report_done(&job_id, Some(artifact_id)).await,
            Err(message) => self.report_error(&job_id, &message).await,
        }
        self.cleanup_processing_files(&job_id, &job.input_path, &output_dir)
            .await;
    }

    async fn process_and_upload(
        &self,
        job: &ProcessingJob,
        output_dir: &Path,
    ) -> Result<ArtifactId, String> {
        if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
            return Err(format!("Failed to create the job working directory: {e}"));
        }
        let output_name = format!("processed_{}", job.metadata.file_name);
        let output_path = output_dir.join(&output_name);

        match self
            .transform
            .run(&job.job_id, &job.metadata, &job.input_path, &output_path)
            .await
        {
            Ok(TransformOutcome::Success) => {}
            Ok(outcome) => {
                return Err(outcome
                    .message()
                    .unwrap_or("Processing failed")
                    .to_string());
            }
            Err(e) => return Err(format!("Processing failed: {e:#}")),
        }

        info!(job_id = %job.job_id, from = %JobState::Processing, to = %JobState::Uploading, "job state transition");
        self.upload_artifact(&job.job_id, &job.metadata, &output_path, &output_name)
            .await
            .map_err(|e| format!("Upload of the processed file failed: {e:#}"))
    }

    /// Chunked upload handshake with the catalog for the processed output.
    /// A sidecar `<output>.metadata.json` written by the transform, if
    /// present, rides along on the finalize call.
    async fn upload_artifact(
        &self,
        job_id: &JobId,
        metadata: &JobMetadata,
        output_path: &Path,
        output_name: &str,
    ) -> Result<ArtifactId> {
        let file_size = tokio::fs::metadata(output_path)
            .await
            .context("failed to stat processed output")?
            .len();
        let total_chunks =
            u32::try_from(file_size.div_ceil(self.upload_chunk_size as u64))
                .context("processed output has too many upload chunks")?;

        let handle = self
            .catalog
            .initiate_chunked_upload(InitiateUploadRequest {
                job_id: job_id.clone(),
                original_file_name: output_name.to_string(),
                operation_type: metadata.operation.as_upper(),
                mime_type: mime_type_for(&metadata.file_name).to_string(),
                total_chunks,
                file_size,
                metadata_json_base64: None,
            })
            .await?;

        let mut file = File::open(output_path)
            .await
            .context("failed to open processed output")?;
        let mut buf = vec![0u8; self.upload_chunk_size];
        let mut sent: u32 = 0;
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file
                    .read(&mut buf[filled..])
                    .await
                    .context("failed to read processed output")?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            self.catalog.upload_chunk(&handle, sent, &buf[..filled]).await?;
            sent += 1;
            if filled < buf.len() {
                break;
            }
        }
        if sent != total_chunks {
            bail!("uploaded {sent} chunks but the file size implies {total_chunks}");
        }

        let sidecar = PathBuf::from(format!("{}.metadata.json", output_path.display()));
        let extra_metadata = match tokio::fs::read_to_string(&sidecar).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(job_id = %job_id, "transform sidecar metadata is not valid JSON: {e}");
                    None
                }
            },
            Err(_) => None,
        };

        self.catalog
            .finalize_chunked_upload(&handle, output_name, total_chunks, extra_metadata)
            .await
    }

    /// Terminates a job from outside its normal flow, after a delivery
    /// error or a failed registration. Safe when the job no longer exists.
    pub async fn force_fail(&self, job_id: &JobId, message: &str) {
        if let Some(buffer) = self.registry.remove(job_id) {
            buffer.lock().await.cleanup().await;
        }
        self.report_error(job_id, message).await;
    }

    async fn report_done(&self, job_id: &JobId, artifact_id: Option<ArtifactId>) {
        if let Err(e) = self
            .catalog
            .update_job_status(job_id, JobStatus::Done, artifact_id.as_ref(), None)
            .await
        {
            error!(job_id = %job_id, "failed to record DONE status in catalog: {e:#}");
        }
        self.metrics.jobs_completed.add(1, &[]);
        info!(job_id = %job_id, to = %JobState::Done, "job state transition");
        self.notifications
            .publish(NotificationEvent::done(job_id.clone(), artifact_id))
            .await;
    }

    async fn report_error(&self, job_id: &JobId, message: &str) {
        warn!(job_id = %job_id, error_message = message, "job failed");
        if let Err(e) = self
            .catalog
            .update_job_status(job_id, JobStatus::Error, None, Some(message))
            .await
        {
            error!(job_id = %job_id, "failed to record ERROR status in catalog: {e:#}");
        }
        self.metrics.jobs_failed.add(1, &[]);
        info!(job_id = %job_id, to = %JobState::Error, "job state transition");
        self.notifications
            .publish(NotificationEvent::error(job_id.clone(), message))
            .await;
    }

    async fn cleanup_processing_files(&self, job_id: &JobId, input: &Path, output_dir: &Path) {
        match tokio::fs::remove_file(input).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, path = %input.display(), "failed to remove input file: {e}"),
        }
        match tokio::fs::remove_dir_all(output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, path = %output_dir.display(), "failed to remove working directory: {e}"),
        }
    }
}
