//! Service layer
//!
//! Services contain the worker's business logic: unpacking and packing
//! archives, invoking the external builder, and driving a task through
//! the pipeline stages.
//!
//! Archiving and building sit behind traits so the pipeline can be tested
//! without a real export tool.

mod archive;
mod builder;
mod pipeline;

// Re-export traits
pub use archive::ArchiveService;
pub use builder::BuildService;

// Re-export implementations
pub use archive::{ArchiveError, TarArchiver};
pub use builder::{BuildError, BuilderConfig, CommandBuilder};
pub use pipeline::{TaskPipeline, WorkspaceSettings};

#[cfg(test)]
pub use builder::BuildOutput;
