//! Error types for the Kiln clients

use thiserror::Error;

/// Errors raised by the artifact store client
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object exists under the key
    #[error("Object not found: {key}")]
    NotFound { key: String },

    /// The store could not be reached or refused the request
    #[error("Object store request for '{key}' failed: {source}")]
    Transport {
        key: String,
        #[source]
        source: object_store::Error,
    },

    /// Reading the body of an upload failed
    #[error("Failed to read upload body for '{key}': {source}")]
    Body {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Finishing a streamed upload failed
    #[error("Failed to complete upload of '{key}': {source}")]
    Upload {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The client could not be built from its configuration
    #[error("Invalid object store configuration: {0}")]
    Config(#[source] object_store::Error),
}

impl StoreError {
    /// Classifies an `object_store` error for the given key
    pub fn from_object_store(key: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            source => Self::Transport {
                key: key.to_string(),
                source,
            },
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised by the task queue client
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker connection or channel failure
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Task could not be serialized for publishing
    #[error("Failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),

    /// Broker did not confirm a published message
    #[error("Broker rejected published message")]
    NotConfirmed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
