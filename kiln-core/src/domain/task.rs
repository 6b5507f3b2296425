//! Build task domain type

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request to build one project archive for one export profile
///
/// Wire format (JSON): `{ "key": "<source object>", "buildType": "<profile>" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Key of the source archive in the artifact store
    #[serde(rename = "key")]
    pub source_key: String,

    /// Export profile handed to the builder, also used as the output sub-path
    #[serde(rename = "buildType")]
    pub build_profile: String,
}

/// Errors produced while decoding a task payload
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not JSON, or a field is missing or has the wrong type
    #[error("malformed task payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid source key '{key}': {reason}")]
    InvalidSourceKey { key: String, reason: &'static str },

    #[error("invalid build profile '{profile}': {reason}")]
    InvalidBuildProfile {
        profile: String,
        reason: &'static str,
    },
}

impl BuildTask {
    /// Creates a new build task
    pub fn new(source_key: impl Into<String>, build_profile: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            build_profile: build_profile.into(),
        }
    }

    /// Decodes and validates a task from a raw message payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let task: Self = serde_json::from_slice(payload)?;
        task.validate()?;
        Ok(task)
    }

    /// Encodes the task into its JSON wire format
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Checks that both fields can be safely turned into local paths
    pub fn validate(&self) -> Result<(), DecodeError> {
        let key_error = |reason| DecodeError::InvalidSourceKey {
            key: self.source_key.clone(),
            reason,
        };

        if self.source_key.is_empty() {
            return Err(key_error("must not be empty"));
        }
        if self.source_key.split('/').any(|segment| segment == "..") {
            return Err(key_error("must not contain '..' segments"));
        }
        if self.archive_name().is_empty() {
            return Err(key_error("must name an object, not a prefix"));
        }
        if self.project_id().is_empty() {
            return Err(key_error("file name must start with a project name"));
        }

        let profile_error = |reason| DecodeError::InvalidBuildProfile {
            profile: self.build_profile.clone(),
            reason,
        };

        if self.build_profile.is_empty() {
            return Err(profile_error("must not be empty"));
        }
        if self.build_profile.contains(['/', '\\']) {
            return Err(profile_error("must not contain path separators"));
        }
        if self.build_profile == "." || self.build_profile == ".." {
            return Err(profile_error("must not be a relative path"));
        }

        Ok(())
    }

    /// File name of the source archive (last `/` segment of the key)
    pub fn archive_name(&self) -> &str {
        self.source_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.source_key)
    }

    /// Project identifier: the archive file name up to its first `.`
    ///
    /// `projects/proj123.tar.gz` yields `proj123`.
    pub fn project_id(&self) -> &str {
        let name = self.archive_name();
        name.split('.').next().unwrap_or(name)
    }
}
