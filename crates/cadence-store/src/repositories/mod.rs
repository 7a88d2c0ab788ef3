//! Repository implementations.

pub mod pipeline;

pub use pipeline::MemoryPipelineRepository;
