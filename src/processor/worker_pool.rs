use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};

use crate::processor::{JobOrchestrator, ProcessingJob};

/// Fixed-size pool of processing workers fed from an unbounded submission
/// queue, so the delivery path never blocks on a busy worker. Workers stop
/// when the service-wide shutdown channel fires or the queue closes.
pub struct WorkerPool {
    queue_tx: mpsc::UnboundedSender<ProcessingJob>,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Arc<JobOrchestrator>,
        worker_count: usize,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<ProcessingJob>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..worker_count {
            let orchestrator = orchestrator.clone();
            let queue_rx = queue_rx.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                info!(worker_id, "processing worker shutting down");
                                return;
                            }
                            job = rx.recv() => job,
                        }
                    };
                    match job {
                        Some(job) => orchestrator.run_processing(job).await,
                        None => return,
                    }
                }
            });
        }
        Self { queue_tx }
    }

    /// Fire-and-forget submission. Fails only when the pool has shut down.
    pub fn submit(&self, job: ProcessingJob) -> Result<()> {
        self.queue_tx.send(job).map_err(|e| {
            error!(job_id = %e.0.job_id, "worker pool is shut down, dropping job");
            anyhow!("worker pool is shut down")
        })
    }
}
