//! Kiln Clients
//!
//! Thin clients for the two external systems a build worker talks to:
//! - Artifact store: S3 compatible object storage holding source archives
//!   and build artifacts
//! - Task queue: RabbitMQ queue carrying build tasks
//!
//! Both the worker and the CLI use these, so connection handling lives in one place.
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::{ArtifactStore, ObjectStoreArtifacts, collect_bytes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ObjectStoreArtifacts::in_memory();
//!     let body = collect_bytes(store.get("proj123_web.tar.gz").await?).await?;
//!     println!("{} bytes", body.len());
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod error;
pub mod queue;
pub mod store;

// Re-export commonly used types
pub use amqp::{AmqpConfig, AmqpQueue, AmqpTaskSource};
pub use error::{QueueError, StoreError};
pub use queue::{MessageAcker, TaskMessage, TaskSource};
pub use store::{
    ArtifactStore, ByteStream, ObjectStoreArtifacts, S3Config, collect_bytes, stream_bytes,
    stream_file,
};
