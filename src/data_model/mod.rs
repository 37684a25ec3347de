use std::fmt::{self, Display};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use strum::Display as StrumDisplay;

use crate::utils::get_epoch_time_in_ms;

/// Opaque, caller-supplied job identifier. Treated as untrusted: validated
/// non-empty at the broker boundary, never parsed beyond that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct JobId(String);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn get(&self) -> &str {
        &self.0
    }

    /// Job ids become path components for the assembly sink and the job's
    /// working directory. An id that could traverse outside the temp dir
    /// is rejected before any path is built from it.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains(['/', '\\', '\0'])
            && !self.0.contains("..")
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a durable artifact stored by the catalog service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ArtifactId {
    #[allow(dead_code)]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Handle returned by the catalog when a chunked upload is initiated, used
/// for the subsequent chunk and finalize calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct UploadHandle(String);

impl Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UploadHandle {
    #[allow(dead_code)]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UploadHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Inbound chunk message as delivered by the broker. A message that fails
/// to deserialize, or carries an empty `jobId`, is dead-lettered at the
/// consumer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub job_id: String,
    pub chunk_id: u32,
    pub total_chunks: u32,
    #[serde(default)]
    pub first_chunk: bool,
    #[serde(default)]
    pub metadata_json: Option<String>,
    #[serde(default)]
    pub chunk_data_b64: Option<String>,
}

impl ChunkMessage {
    pub fn has_payload(&self) -> bool {
        self.chunk_data_b64.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Decodes the base64 payload. An absent or empty field is a valid
    /// empty payload.
    pub fn decoded_payload(&self) -> Result<Bytes> {
        match &self.chunk_data_b64 {
            Some(data) if !data.is_empty() => {
                let decoded = BASE64
                    .decode(data)
                    .context("chunk payload is not valid base64")?;
                Ok(Bytes::from(decoded))
            }
            _ => Ok(Bytes::new()),
        }
    }
}

/// Declared transformation operation. Anything other than the two known
/// operations is carried through verbatim for the catalog and transform
/// executable to interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobOperation {
    Encrypt,
    Decrypt,
    Other(String),
}

impl From<String> for JobOperation {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "ENCRYPT" => JobOperation::Encrypt,
            "DECRYPT" => JobOperation::Decrypt,
            _ => JobOperation::Other(value),
        }
    }
}

impl From<JobOperation> for String {
    fn from(value: JobOperation) -> Self {
        value.as_upper()
    }
}

impl JobOperation {
    /// Canonical uppercase form, used on the catalog wire.
    pub fn as_upper(&self) -> String {
        match self {
            JobOperation::Encrypt => "ENCRYPT".to_string(),
            JobOperation::Decrypt => "DECRYPT".to_string(),
            JobOperation::Other(op) => op.to_ascii_uppercase(),
        }
    }

    /// Lowercase form passed as a positional argument to the transform
    /// executable.
    pub fn as_arg(&self) -> String {
        self.as_upper().to_ascii_lowercase()
    }
}

impl Display for JobOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_upper())
    }
}

fn default_key_size() -> u32 {
    128
}

// The producer side has shipped non-numeric key sizes before; fall back to
// the default instead of failing the whole job.
fn key_size_or_default<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(default_key_size))
}

/// Job metadata parsed from the first chunk's `metadataJson`. Set exactly
/// once per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub file_name: String,
    pub operation: JobOperation,
    pub mode: String,
    pub key: String,
    #[serde(
        default = "default_key_size",
        deserialize_with = "key_size_or_default"
    )]
    pub key_size: u32,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub original_file_size: u64,
}

impl JobMetadata {
    /// CBC-family modes require an IV on the transform command line. A
    /// missing IV is logged at initialization but only the executable
    /// rejects it.
    pub fn requires_iv(&self) -> bool {
        self.mode.to_ascii_uppercase().contains("CBC")
    }
}

/// Job status as reported to the catalog and to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Done,
    Error,
}

/// Lifecycle states of a job inside the orchestrator. `Done` and `Error`
/// are terminal; a terminal job is evicted from the registry and cannot be
/// resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Receiving,
    Registering,
    Assembling,
    Processing,
    Uploading,
    Done,
    Error,
}

/// Status event published on the broker and delivered to the job's live
/// subscriber, if any. `download_url` is derived from `artifact_id` at
/// delivery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<ArtifactId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub timestamp_ms: u64,
}

impl NotificationEvent {
    pub fn running(job_id: JobId) -> Self {
        Self::new(job_id, JobStatus::Running, None, None)
    }

    pub fn done(job_id: JobId, artifact_id: Option<ArtifactId>) -> Self {
        Self::new(job_id, JobStatus::Done, artifact_id, None)
    }

    pub fn error(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, JobStatus::Error, None, Some(message.into()))
    }

    fn new(
        job_id: JobId,
        status: JobStatus,
        artifact_id: Option<ArtifactId>,
        error_message: Option<String>,
    ) -> Self {
        Self {
            job_id,
            status,
            artifact_id,
            error_message,
            download_url: None,
            timestamp_ms: get_epoch_time_in_ms(),
        }
    }

    pub fn with_download_url(mut self) -> Self {
        if let Some(artifact_id) = &self.artifact_id {
            self.download_url = Some(format!("/api/artifacts/{artifact_id}/download"));
        }
        self
    }
}

/// Mime type inferred from the original file name, used when registering
/// uploads with the catalog.
pub fn mime_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".bmp") {
        "image/bmp"
    } else {
        "application/octet-stream"
    }
}
