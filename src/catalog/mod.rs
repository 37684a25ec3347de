use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::CatalogConfig,
    data_model::{ArtifactId, JobId, JobStatus, UploadHandle},
};

/// Parameters for registering a chunked upload with the catalog, used both
/// for the original payload record and for the processed artifact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub job_id: JobId,
    pub original_file_name: String,
    pub operation_type: String,
    pub mime_type: String,
    pub total_chunks: u32,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_json_base64: Option<String>,
}

/// The catalog service of record for job metadata, status, and final
/// artifacts. Injected as a trait object so orchestration logic can be
/// exercised against an in-memory stub.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Registers the job record. A failure here aborts the job.
    async fn create_job_record(
        &self,
        job_id: &JobId,
        file_name: &str,
        operation: &str,
        mode: &str,
    ) -> Result<()>;

    async fn initiate_chunked_upload(&self, req: InitiateUploadRequest) -> Result<UploadHandle>;

    async fn upload_chunk(&self, handle: &UploadHandle, chunk_id: u32, data: &[u8]) -> Result<()>;

    async fn finalize_chunked_upload(
        &self,
        handle: &UploadHandle,
        file_name: &str,
        total_chunks: u32,
        extra_metadata: Option<serde_json::Value>,
    ) -> Result<ArtifactId>;

    /// Best effort: callers log a failure and move on, the job outcome is
    /// already decided when this is called.
    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        artifact_id: Option<&ArtifactId>,
        error_message: Option<&str>,
    ) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobPayload<'a> {
    job_id: &'a JobId,
    original_file_name: &'a str,
    operation: &'a str,
    mode: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadChunkPayload<'a> {
    job_id: &'a UploadHandle,
    chunk_id: u32,
    chunk_data_b64: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeUploadPayload<'a> {
    job_id: &'a UploadHandle,
    file_name: &'a str,
    total_chunks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatusPayload<'a> {
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_id: Option<&'a ArtifactId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateUploadResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeUploadResponse {
    artifact_id: String,
}

/// HTTP implementation of the catalog contract. Every request carries the
/// configured timeout; non-2xx responses fold the status and body into the
/// error. Failures are never retried here.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build catalog http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_for_response(
        context: &str,
        response: reqwest::Response,
    ) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow!("{context} (HTTP {status}): {body}")
    }
}

#[async_trait]
impl CatalogApi for HttpCatalog {
    async fn create_job_record(
        &self,
        job_id: &JobId,
        file_name: &str,
        operation: &str,
        mode: &str,
    ) -> Result<()> {
        let payload = CreateJobPayload {
            job_id,
            original_file_name: file_name,
            operation,
            mode,
        };
        debug!(job_id = %job_id, "creating catalog job record");
        let response = self
            .client
            .post(self.url("/api/jobs"))
            .json(&payload)
            .send()
            .await
            .context("catalog create-job-record request failed")?;
        if response.status() != StatusCode::CREATED {
            return Err(Self::error_for_response("failed to create catalog job record", response).await);
        }
        info!(job_id = %job_id, "catalog job record created");
        Ok(())
    }

    async fn initiate_chunked_upload(&self, req: InitiateUploadRequest) -> Result<UploadHandle> {
        debug!(
            job_id = %req.job_id,
            file_name = %req.original_file_name,
            total_chunks = req.total_chunks,
            file_size = req.file_size,
            "initiating chunked upload"
        );
        let response = self
            .client
            .post(self.url("/api/artifacts/initiate-chunked-upload"))
            .json(&req)
            .send()
            .await
            .context("catalog initiate-chunked-upload request failed")?;
        if !response.status().is_success() {
            return Err(Self::error_for_response("failed to initiate chunked upload", response).await);
        }
        let body: InitiateUploadResponse = response
            .json()
            .await
            .context("invalid initiate-chunked-upload response")?;
        Ok(UploadHandle::from(body.job_id.as_str()))
    }

    async fn upload_chunk(&self, handle: &UploadHandle, chunk_id: u32, data: &[u8]) -> Result<()> {
        let payload = UploadChunkPayload {
            job_id: handle,
            chunk_id,
            chunk_data_b64: BASE64.encode(data),
        };
        let response = self
            .client
            .post(self.url("/api/artifacts/upload-chunk"))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("catalog upload-chunk {chunk_id} request failed"))?;
        if !response.status().is_success() {
            return Err(Self::error_for_response(
                &format!("failed to upload chunk {chunk_id}"),
                response,
            )
            .await);
        }
        Ok(())
    }

    async fn finalize_chunked_upload(
        &self,
        handle: &UploadHandle,
        file_name: &str,
        total_chunks: u32,
        extra_metadata: Option<serde_json::Value>,
    ) -> Result<ArtifactId> {
        let payload = FinalizeUploadPayload {
            job_id: handle,
            file_name,
            total_chunks,
            extra_metadata,
        };
        let response = self
            .client
            .post(self.url("/api/artifacts/finalize-chunked-upload"))
            .json(&payload)
            .send()
            .await
            .context("catalog finalize-chunked-upload request failed")?;
        if !response.status().is_success() {
            return Err(Self::error_for_response("failed to finalize chunked upload", response).await);
        }
        let body: FinalizeUploadResponse = response
            .json()
            .await
            .context("invalid finalize-chunked-upload response")?;
        info!(upload_handle = %handle, artifact_id = %body.artifact_id, "chunked upload finalized");
        Ok(ArtifactId::from(body.artifact_id.as_str()))
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        artifact_id: Option<&ArtifactId>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let payload = UpdateStatusPayload {
            status,
            artifact_id,
            error_message,
        };
        debug!(job_id = %job_id, status = %status, "updating catalog job status");
        let response = self
            .client
            .put(self.url(&format!("/api/jobs/{job_id}")))
            .json(&payload)
            .send()
            .await
            .context("catalog update-job-status request failed")?;
        if !response.status().is_success() {
            return Err(Self::error_for_response("failed to update catalog job status", response).await);
        }
        Ok(())
    }
}
