pub mod chunk_buffer;
pub mod registry;

pub use chunk_buffer::ChunkBuffer;
pub use registry::JobRegistry;
