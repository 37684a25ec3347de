use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::Mutex;
use tracing::info;

use crate::{data_model::JobId, ingest::ChunkBuffer};

/// Concurrent map of in-flight jobs. Exactly one `ChunkBuffer` is ever
/// constructed per job id, even under concurrent delivery; removal returns
/// the instance so the caller can run its cleanup exactly once.
pub struct JobRegistry {
    temp_dir: PathBuf,
    jobs: DashMap<JobId, Arc<Mutex<ChunkBuffer>>>,
}

impl JobRegistry {
    pub fn new(temp_dir: PathBuf) -> Self {
        Self {
            temp_dir,
            jobs: DashMap::new(),
        }
    }

    /// Atomic upsert. The entry lock is held across construction so a
    /// racing delivery for the same id observes either no entry or the
    /// fully constructed one; a failing constructor installs nothing.
    pub fn get_or_create(&self, job_id: &JobId) -> Result<Arc<Mutex<ChunkBuffer>>> {
        match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                info!(job_id = %job_id, "creating chunk buffer for new job");
                let buffer = ChunkBuffer::new(job_id.clone(), &self.temp_dir)?;
                let buffer = Arc::new(Mutex::new(buffer));
                entry.insert(buffer.clone());
                Ok(buffer)
            }
        }
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Arc<Mutex<ChunkBuffer>>> {
        self.jobs.remove(job_id).map(|(_, buffer)| buffer)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
