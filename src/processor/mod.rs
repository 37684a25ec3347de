pub mod orchestrator;
pub mod transform;
pub mod worker_pool;

pub use orchestrator::{JobOrchestrator, ProcessingJob};
pub use worker_pool::WorkerPool;
