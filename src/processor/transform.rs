use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::data_model::{JobId, JobMetadata};

/// Environment variable carrying the job key to the transform executable.
/// The key never appears on the command line.
const PROCESSING_KEY_ENV: &str = "PROCESSING_KEY";

/// Recognized failure signatures in the transform's output, checked in
/// order. These are the strings OpenSSL-backed tooling emits when a
/// decryption key or IV does not match the payload.
const DIAGNOSTIC_RULES: &[(&str, &str)] = &[
    ("bad decrypt", KEY_MISMATCH_MESSAGE),
    ("wrong final block length", KEY_MISMATCH_MESSAGE),
    ("error:0606506D", KEY_MISMATCH_MESSAGE),
    ("digital envelope routines", KEY_MISMATCH_MESSAGE),
    ("bad magic number", KEY_MISMATCH_MESSAGE),
];

const KEY_MISMATCH_MESSAGE: &str =
    "Decryption failed: the provided key or IV does not match this file";

/// Outcome of one transform run, already classified for reporting.
#[derive(Debug)]
pub enum TransformOutcome {
    /// Exit code 0 and a non-empty output file.
    Success,
    /// The watchdog expired and the child was killed.
    TimedOut { message: String },
    /// Any other failure, with a user-facing message derived from the
    /// diagnostic rule table or the raw exit status and output.
    Failed { message: String },
}

impl TransformOutcome {
    pub fn message(&self) -> Option<&str> {
        match self {
            TransformOutcome::Success => None,
            TransformOutcome::TimedOut { message } | TransformOutcome::Failed { message } => {
                Some(message)
            }
        }
    }
}

/// Maps captured transform output to a user-facing message. Falls back to
/// the exit status plus a trimmed excerpt of the combined output.
pub fn classify_failure(exit_description: &str, combined_output: &str) -> String {
    for (signature, message) in DIAGNOSTIC_RULES {
        if combined_output.contains(signature) {
            return (*message).to_string();
        }
    }
    let excerpt: String = combined_output.trim().chars().take(500).collect();
    if excerpt.is_empty() {
        format!("Processing failed ({exit_description})")
    } else {
        format!("Processing failed ({exit_description}): {excerpt}")
    }
}

/// Runs the external transform executable for one job under a watchdog
/// timeout.
pub struct TransformRunner {
    executable: PathBuf,
    watchdog_timeout: Duration,
}

impl TransformRunner {
    pub fn new(executable: PathBuf, watchdog_timeout: Duration) -> Self {
        Self {
            executable,
            watchdog_timeout,
        }
    }

    /// Invokes the executable with argv
    /// `<input> <output> <operation> <key_size> <mode> [iv]` and the key in
    /// the `PROCESSING_KEY` environment variable. The IV argument is passed
    /// only for CBC-family modes.
    pub async fn run(
        &self,
        job_id: &JobId,
        metadata: &JobMetadata,
        input: &Path,
        output: &Path,
    ) -> Result<TransformOutcome> {
        let mut command = Command::new(&self.executable);
        command
            .arg(input)
            .arg(output)
            .arg(metadata.operation.as_arg())
            .arg(metadata.key_size.to_string())
            .arg(&metadata.mode)
            .env(PROCESSING_KEY_ENV, &metadata.key)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if metadata.requires_iv() {
            command.arg(metadata.iv.as_deref().unwrap_or(""));
        }

        info!(
            job_id = %job_id,
            executable = %self.executable.display(),
            operation = %metadata.operation,
            mode = %metadata.mode,
            "invoking transform executable"
        );
        let child = command.spawn().with_context(|| {
            format!(
                "failed to spawn transform executable {}",
                self.executable.display()
            )
        })?;

        let output_result =
            match tokio::time::timeout(self.watchdog_timeout, child.wait_with_output()).await {
                Ok(result) => result.context("failed waiting for transform executable")?,
                Err(_) => {
                    // kill_on_drop reaps the child once the future is
                    // dropped by the timeout.
                    error!(
                        job_id = %job_id,
                        timeout_secs = self.watchdog_timeout.as_secs(),
                        "transform watchdog expired, child killed"
                    );
                    return Ok(TransformOutcome::TimedOut {
                        message: format!(
                            "Processing timed out after {} seconds and was terminated",
                            self.watchdog_timeout.as_secs()
                        ),
                    });
                }
            };

        let stdout = String::from_utf8_lossy(&output_result.stdout);
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        let combined = format!("{stdout}\n{stderr}");

        if output_result.status.success() {
            match tokio::fs::metadata(output).await {
                Ok(meta) if meta.len() > 0 => {
                    info!(
                        job_id = %job_id,
                        output_bytes = meta.len(),
                        "transform completed"
                    );
                    return Ok(TransformOutcome::Success);
                }
                Ok(_) => {
                    warn!(job_id = %job_id, "transform exited cleanly but produced an empty output file");
                    return Ok(TransformOutcome::Failed {
                        message: format!(
                            "{}; the output file is empty",
                            classify_failure("exit code 0", &combined)
                        ),
                    });
                }
                Err(_) => {
                    warn!(job_id = %job_id, "transform exited cleanly but produced no output file");
                    return Ok(TransformOutcome::Failed {
                        message: format!(
                            "{}; no output file was produced",
                            classify_failure("exit code 0", &combined)
                        ),
                    });
                }
            }
        }

        let exit_description = match output_result.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        warn!(
            job_id = %job_id,
            exit = %exit_description,
            stderr = %stderr.trim(),
            "transform executable failed"
        );
        Ok(TransformOutcome::Failed {
            message: classify_failure(&exit_description, &combined),
        })
    }
}
