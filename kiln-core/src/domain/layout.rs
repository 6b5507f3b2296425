//! Run layout
//!
//! Every local path and the result key used while processing a task are
//! derived here. Derivation is pure: the same run root and task always
//! produce the same layout, and the result key depends on the task alone,
//! so a redelivered task uploads to the same key.

use std::path::{Path, PathBuf};

use super::task::BuildTask;

/// Suffix shared by packaged build outputs and result artifacts
pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

/// Local paths and remote key for one pipeline run
///
/// ```text
/// <root>/source/<archive name>               fetched source archive
/// <root>/extract/<projectId>/                extracted project
/// <root>/extract/<projectId>/<profile>/      builder output
/// <root>/extract/<projectId>/<profile>.tar.gz packaged output
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    archive_path: PathBuf,
    extract_dir: PathBuf,
    project_dir: PathBuf,
    output_dir: PathBuf,
    package_path: PathBuf,
    result_key: String,
}

impl RunLayout {
    /// Derives the layout for `task` beneath `root`
    pub fn new(root: impl Into<PathBuf>, task: &BuildTask) -> Self {
        let root = root.into();
        let archive_path = root.join("source").join(task.archive_name());
        let extract_dir = root.join("extract");
        let project_dir = extract_dir.join(task.project_id());
        let output_dir = project_dir.join(&task.build_profile);
        let package_path =
            project_dir.join(format!("{}{}", task.build_profile, ARTIFACT_SUFFIX));

        Self {
            root,
            archive_path,
            extract_dir,
            project_dir,
            output_dir,
            package_path,
            result_key: result_key(task),
        }
    }

    /// Run root every other path lives under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local copy of the fetched source archive
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Directory the source archive is extracted into
    ///
    /// Kept apart from the archive so a key without an extension (`proj123`)
    /// cannot collide with the extracted `proj123/` directory.
    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    /// Extracted project directory, the builder's working directory
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Builder destination: `project_dir/<profile>`
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Packaged output: `project_dir/<profile>.tar.gz`
    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    /// Artifact store key the package is uploaded under
    pub fn result_key(&self) -> &str {
        &self.result_key
    }
}

/// Result artifact key: `<projectId>_<profile>.tar.gz`
pub fn result_key(task: &BuildTask) -> String {
    format!(
        "{}_{}{}",
        task.project_id(),
        task.build_profile,
        ARTIFACT_SUFFIX
    )
}
