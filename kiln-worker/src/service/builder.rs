//! External builder invocation
//!
//! Runs the export tool against an extracted project:
//!
//! ```text
//! <program> <args...> <profile> <output_dir>/<output_name>
//! ```
//!
//! with the project directory as working directory. With the default
//! configuration this is `godot --headless --verbose --export-release web
//! <project>/web/index.html`. The process runs under a deadline and is
//! killed if it overruns.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Bytes of combined output kept in a build error
const OUTPUT_TAIL_BYTES: usize = 4096;

/// How the builder executable is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub output_name: String,
    pub timeout: Duration,
}

/// Captured output of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// stdout followed by stderr
    pub output: String,
}

/// Errors raised by a build
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to run builder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("builder exited with {}: {output}", describe_exit(*exit_code))]
    Failed {
        exit_code: Option<i32>,
        /// Tail of the combined output
        output: String,
    },

    #[error("builder timed out after {0:?}")]
    TimedOut(Duration),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Service trait for running builds
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Builds `profile` for the project in `project_dir`, writing into `output_dir`
    async fn build(
        &self,
        project_dir: &Path,
        profile: &str,
        output_dir: &Path,
    ) -> Result<BuildOutput, BuildError>;
}

/// BuildService that spawns the configured executable
pub struct CommandBuilder {
    config: BuilderConfig,
}

impl CommandBuilder {
    /// Creates a new command builder
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Checks that the builder executable can be started
    ///
    /// Runs `<program> --version` and returns the reported version.
    pub async fn check_available(&self) -> Result<String, BuildError> {
        let output = Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BuildError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BuildError::Failed {
                exit_code: output.status.code(),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl BuildService for CommandBuilder {
    async fn build(
        &self,
        project_dir: &Path,
        profile: &str,
        output_dir: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let target = output_dir.join(&self.config.output_name);

        info!(
            "Running {} for profile '{}' into {}",
            self.config.program,
            profile,
            target.display()
        );

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(profile)
            .arg(&target)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| BuildError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        // Dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|source| BuildError::Spawn {
                program: self.config.program.clone(),
                source,
            })?,
            Err(_) => return Err(BuildError::TimedOut(self.config.timeout)),
        };

        let combined = combined_output(&output.stdout, &output.stderr);

        if !output.status.success() {
            return Err(BuildError::Failed {
                exit_code: output.status.code(),
                output: tail(&combined, OUTPUT_TAIL_BYTES).to_string(),
            });
        }

        debug!("Builder output:\n{}", combined.trim_end());
        Ok(BuildOutput { output: combined })
    }
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined
}

/// Last `max` bytes of `text`, cut on a character boundary
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
