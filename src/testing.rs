use std::{
    os::unix::fs::PermissionsExt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    catalog::{CatalogApi, InitiateUploadRequest},
    config::ProcessingConfig,
    data_model::{ArtifactId, ChunkMessage, JobId, JobStatus, NotificationEvent, UploadHandle},
    metrics::Metrics,
    notify::{NotificationRouter, NotificationSink, SessionRegistry},
    processor::{JobOrchestrator, WorkerPool},
};

/// Transform stand-in that copies input to output. Also asserts the key
/// arrived through the environment, never argv.
pub const COPY_TRANSFORM: &str = "#!/bin/sh
test -n \"$PROCESSING_KEY\" || exit 9
cp \"$1\" \"$2\"
";

/// Copies input to output and writes a sidecar metadata file next to it.
pub const SIDECAR_TRANSFORM: &str = "#!/bin/sh
cp \"$1\" \"$2\"
printf '{\"width\":100}' > \"$2.metadata.json\"
";

/// Fails the way OpenSSL does on a wrong decryption key.
pub const KEY_MISMATCH_TRANSFORM: &str = "#!/bin/sh
echo 'error: bad decrypt' >&2
exit 1
";

/// Sleeps past any short watchdog.
pub const HANG_TRANSFORM: &str = "#!/bin/sh
sleep 30
";

pub fn job_metadata_json(file_name: &str, operation: &str, mode: &str) -> String {
    format!(
        r#"{{"fileName":"{file_name}","operation":"{operation}","mode":"{mode}","key":"test-key","keySize":256,"iv":"00112233445566778899aabbccddeeff","originalFileSize":30}}"#
    )
}

pub fn first_chunk_message(job_id: &str, total_chunks: u32, metadata_json: &str) -> ChunkMessage {
    ChunkMessage {
        job_id: job_id.to_string(),
        chunk_id: 0,
        total_chunks,
        first_chunk: true,
        metadata_json: Some(metadata_json.to_string()),
        chunk_data_b64: None,
    }
}

pub fn data_chunk_message(
    job_id: &str,
    chunk_id: u32,
    total_chunks: u32,
    payload: &[u8],
) -> ChunkMessage {
    ChunkMessage {
        job_id: job_id.to_string(),
        chunk_id,
        total_chunks,
        first_chunk: false,
        metadata_json: None,
        chunk_data_b64: Some(BASE64.encode(payload)),
    }
}

/// One chunked upload as seen by the stub catalog.
pub struct UploadRecord {
    pub request: InitiateUploadRequest,
    pub chunks: Vec<Vec<u8>>,
    pub finalized: Option<FinalizedUpload>,
}

pub struct FinalizedUpload {
    pub file_name: String,
    pub total_chunks: u32,
    pub extra_metadata: Option<serde_json::Value>,
}

impl UploadRecord {
    pub fn assembled_bytes(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// In-memory catalog double. Records every call; individual operations can
/// be flipped to fail.
#[derive(Default)]
pub struct StubCatalog {
    pub fail_create_job: AtomicBool,
    pub fail_finalize: AtomicBool,
    pub jobs_created: Mutex<Vec<JobId>>,
    pub uploads: Mutex<Vec<UploadRecord>>,
    pub status_updates: Mutex<Vec<(JobId, JobStatus, Option<ArtifactId>, Option<String>)>>,
    next_handle: AtomicU64,
}

impl StubCatalog {
    fn upload_index(handle: &UploadHandle) -> usize {
        handle
            .get()
            .strip_prefix("upload-")
            .and_then(|n| n.parse().ok())
            .unwrap_or(usize::MAX)
    }

    pub fn finalized_uploads(&self) -> usize {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.finalized.is_some())
            .count()
    }
}

#[async_trait]
impl CatalogApi for StubCatalog {
    async fn create_job_record(
        &self,
        job_id: &JobId,
        _file_name: &str,
        _operation: &str,
        _mode: &str,
    ) -> Result<()> {
        if self.fail_create_job.load(Ordering::SeqCst) {
            anyhow::bail!("catalog unavailable");
        }
        self.jobs_created.lock().unwrap().push(job_id.clone());
        Ok(())
    }

    async fn initiate_chunked_upload(&self, req: InitiateUploadRequest) -> Result<UploadHandle> {
        let mut uploads = self.uploads.lock().unwrap();
        let handle = UploadHandle::from(
            format!("upload-{}", self.next_handle.fetch_add(1, Ordering::SeqCst)).as_str(),
        );
        uploads.push(UploadRecord {
            request: req,
            chunks: Vec::new(),
            finalized: None,
        });
        Ok(handle)
    }

    async fn upload_chunk(&self, handle: &UploadHandle, chunk_id: u32, data: &[u8]) -> Result<()> {
        let mut uploads = self.uploads.lock().unwrap();
        let record = uploads
            .get_mut(Self::upload_index(handle))
            .ok_or_else(|| anyhow::anyhow!("unknown upload handle {handle}"))?;
        anyhow::ensure!(record.chunks.len() == chunk_id as usize, "chunks out of order");
        record.chunks.push(data.to_vec());
        Ok(())
    }

    async fn finalize_chunked_upload(
        &self,
        handle: &UploadHandle,
        file_name: &str,
        total_chunks: u32,
        extra_metadata: Option<serde_json::Value>,
    ) -> Result<ArtifactId> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            anyhow::bail!("catalog rejected the upload");
        }
        let mut uploads = self.uploads.lock().unwrap();
        let index = Self::upload_index(handle);
        let record = uploads
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("unknown upload handle {handle}"))?;
        record.finalized = Some(FinalizedUpload {
            file_name: file_name.to_string(),
            total_chunks,
            extra_metadata,
        });
        Ok(ArtifactId::from(format!("artifact-{index}").as_str()))
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        artifact_id: Option<&ArtifactId>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.status_updates.lock().unwrap().push((
            job_id.clone(),
            status,
            artifact_id.cloned(),
            error_message.map(str::to_string),
        ));
        Ok(())
    }
}

/// Notification sink double recording every durable publish.
#[derive(Default)]
pub struct CapturingSink {
    pub events: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl NotificationSink for CapturingSink {
    async fn publish(&self, event: &NotificationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fully wired orchestrator over temp dirs, the stub catalog, the
/// capturing sink, and a shell-script transform executable.
pub struct TestService {
    pub temp_dir: tempfile::TempDir,
    pub catalog: Arc<StubCatalog>,
    pub sink: Arc<CapturingSink>,
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub shutdown_tx: watch::Sender<()>,
}

impl TestService {
    pub fn new(transform_script: &str) -> Result<Self> {
        Self::with_watchdog(transform_script, 30)
    }

    pub fn with_watchdog(transform_script: &str, watchdog_timeout_secs: u64) -> Result<Self> {
        Self::build(transform_script, watchdog_timeout_secs, true)
    }

    /// Orchestrator with no worker pool attached, for exercising dispatch
    /// failures.
    pub fn without_worker_pool(transform_script: &str) -> Result<Self> {
        Self::build(transform_script, 30, false)
    }

    fn build(
        transform_script: &str,
        watchdog_timeout_secs: u64,
        attach_pool: bool,
    ) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("transform.sh");
        std::fs::write(&script_path, transform_script)?;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;

        let processing = ProcessingConfig {
            temp_dir: temp_dir.path().join("work"),
            transform_executable: script_path,
            worker_count: 2,
            watchdog_timeout_secs,
            upload_chunk_size_bytes: 512 * 1024,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let metrics = Arc::new(Metrics::default());
        let catalog = Arc::new(StubCatalog::default());
        let sink = Arc::new(CapturingSink::default());
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(NotificationRouter::new(
            sink.clone(),
            sessions.clone(),
            metrics.clone(),
        ));
        let orchestrator = Arc::new(JobOrchestrator::new(
            &processing,
            catalog.clone(),
            router,
            metrics,
        ));
        if attach_pool {
            let pool =
                WorkerPool::new(orchestrator.clone(), processing.worker_count, shutdown_rx);
            orchestrator.attach_worker_pool(pool);
        }

        Ok(Self {
            temp_dir,
            catalog,
            sink,
            sessions,
            orchestrator,
            shutdown_tx,
        })
    }

    pub fn work_dir(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("work")
    }

    /// Blocks until a non-RUNNING event for the job lands in the durable
    /// sink, or panics after the timeout.
    pub async fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> NotificationEvent {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let events = self.sink.events.lock().unwrap();
                if let Some(event) = events
                    .iter()
                    .find(|e| e.job_id.get() == job_id && e.status != JobStatus::Running)
                {
                    return event.clone();
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no terminal event for job {job_id} within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn events_for(&self, job_id: &str) -> Vec<NotificationEvent> {
        self.sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id.get() == job_id)
            .cloned()
            .collect()
    }
}
