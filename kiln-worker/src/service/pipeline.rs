//! Task pipeline service
//!
//! Drives one build task through its stages:
//! decode → fetch → extract → build → package → upload.
//!
//! Stages run strictly in order and the first failure ends the run. The
//! pipeline never settles queue messages itself; it reports the outcome and
//! the consumer turns it into a disposition.

use futures::StreamExt;
use kiln_client::{ArtifactStore, StoreError, stream_file};
use kiln_core::domain::layout::RunLayout;
use kiln_core::domain::stage::Stage;
use kiln_core::domain::task::{BuildTask, DecodeError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::service::{ArchiveError, ArchiveService, BuildError, BuildService};
use crate::workspace::RunWorkspace;

/// Why a run stopped
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed task: {0}")]
    Decode(#[from] DecodeError),

    #[error("{stage} stage: artifact store error: {source}")]
    ArtifactStore {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("{stage} stage: filesystem error on {}: {source}", path.display())]
    Filesystem {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("extract stage: {0}")]
    Extraction(#[source] ArchiveError),

    #[error("build stage: {0}")]
    Build(#[from] BuildError),

    #[error("package stage: {0}")]
    Packaging(#[source] ArchiveError),
}

impl PipelineError {
    /// Stage the run stopped in
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Decode(_) => Stage::Decode,
            PipelineError::ArtifactStore { stage, .. } => *stage,
            PipelineError::Filesystem { stage, .. } => *stage,
            PipelineError::Extraction(_) => Stage::Extract,
            PipelineError::Build(_) => Stage::Build,
            PipelineError::Packaging(_) => Stage::Package,
        }
    }

    fn filesystem(stage: Stage, path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| PipelineError::Filesystem {
            stage,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct CompletedTask {
    /// Key the artifact was uploaded under
    pub result_key: String,
    pub run_id: Uuid,
}

/// Where run directories are created
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub work_root: PathBuf,
    pub keep_run_dirs: bool,
}

/// Runs build tasks against the artifact store, archiver and builder
pub struct TaskPipeline {
    store: Arc<dyn ArtifactStore>,
    archiver: Arc<dyn ArchiveService>,
    builder: Arc<dyn BuildService>,
    settings: WorkspaceSettings,
}

impl TaskPipeline {
    /// Creates a new task pipeline
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        archiver: Arc<dyn ArchiveService>,
        builder: Arc<dyn BuildService>,
        settings: WorkspaceSettings,
    ) -> Self {
        Self {
            store,
            archiver,
            builder,
            settings,
        }
    }

    /// Processes one raw message payload
    ///
    /// Decoding happens before any I/O; a malformed payload touches neither
    /// the store nor the filesystem.
    pub async fn process(&self, payload: &[u8]) -> Result<CompletedTask, PipelineError> {
        let task = match BuildTask::decode(payload) {
            Ok(task) => task,
            Err(e) => {
                error!(
                    stage = %Stage::Decode,
                    payload_len = payload.len(),
                    "Task failed: {}",
                    e
                );
                return Err(e.into());
            }
        };

        let span = info_span!(
            "task",
            source_key = %task.source_key,
            build_profile = %task.build_profile
        );

        async {
            info!("Processing build task");

            let result = self.run(&task).await;
            match &result {
                Ok(done) => info!(
                    result_key = %done.result_key,
                    run_id = %done.run_id,
                    "Task completed"
                ),
                Err(e) => error!(stage = %e.stage(), "Task failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, task: &BuildTask) -> Result<CompletedTask, PipelineError> {
        let workspace =
            RunWorkspace::create(&self.settings.work_root, self.settings.keep_run_dirs)
                .await
                .map_err(PipelineError::filesystem(Stage::Fetch, &self.settings.work_root))?;

        let layout = RunLayout::new(workspace.root(), task);
        debug!(run_id = %workspace.run_id(), "Run layout: {:?}", layout);

        let result = self.run_stages(task, &layout).await;
        let run_id = workspace.run_id();
        // Dropping the workspace covers panics and cancellation
        workspace.cleanup().await;

        result.map(|()| CompletedTask {
            result_key: layout.result_key().to_string(),
            run_id,
        })
    }

    async fn run_stages(&self, task: &BuildTask, layout: &RunLayout) -> Result<(), PipelineError> {
        self.fetch(task, layout).await?;
        self.extract(layout).await?;
        self.build(task, layout).await?;
        self.package(layout).await?;
        self.upload(layout).await
    }

    /// Streams the source archive into the run directory
    async fn fetch(&self, task: &BuildTask, layout: &RunLayout) -> Result<(), PipelineError> {
        let archive_path = layout.archive_path();
        let store_err = |source| PipelineError::ArtifactStore {
            stage: Stage::Fetch,
            source,
        };

        let mut body = self.store.get(&task.source_key).await.map_err(store_err)?;

        if let Some(parent) = archive_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(PipelineError::filesystem(Stage::Fetch, parent))?;
        }
        let mut file = tokio::fs::File::create(archive_path)
            .await
            .map_err(PipelineError::filesystem(Stage::Fetch, archive_path))?;

        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(store_err)?;
            file.write_all(&chunk)
                .await
                .map_err(PipelineError::filesystem(Stage::Fetch, archive_path))?;
            written += chunk.len();
        }
        file.flush()
            .await
            .map_err(PipelineError::filesystem(Stage::Fetch, archive_path))?;

        info!(stage = %Stage::Fetch, bytes = written, "Fetched source archive");
        Ok(())
    }

    async fn extract(&self, layout: &RunLayout) -> Result<(), PipelineError> {
        let extract_dir = layout.extract_dir();
        tokio::fs::create_dir_all(extract_dir)
            .await
            .map_err(PipelineError::filesystem(Stage::Extract, extract_dir))?;

        self.archiver
            .extract(layout.archive_path(), extract_dir)
            .await
            .map_err(PipelineError::Extraction)?;

        // The archive must unpack into a directory named after the project
        let is_dir = tokio::fs::metadata(layout.project_dir())
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(PipelineError::Extraction(ArchiveError::MissingEntry {
                path: layout.project_dir().to_path_buf(),
            }));
        }

        info!(stage = %Stage::Extract, "Extracted project to {}", layout.project_dir().display());
        Ok(())
    }

    async fn build(&self, task: &BuildTask, layout: &RunLayout) -> Result<(), PipelineError> {
        let output_dir = layout.output_dir();
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(PipelineError::filesystem(Stage::Build, output_dir))?;

        let result = self
            .builder
            .build(layout.project_dir(), &task.build_profile, output_dir)
            .await?;

        info!(
            stage = %Stage::Build,
            output_bytes = result.output.len(),
            "Build finished"
        );
        Ok(())
    }

    async fn package(&self, layout: &RunLayout) -> Result<(), PipelineError> {
        self.archiver
            .create(layout.package_path(), layout.output_dir())
            .await
            .map_err(PipelineError::Packaging)?;

        info!(stage = %Stage::Package, "Packaged {}", layout.package_path().display());
        Ok(())
    }

    async fn upload(&self, layout: &RunLayout) -> Result<(), PipelineError> {
        let package_path = layout.package_path();
        let file = tokio::fs::File::open(package_path)
            .await
            .map_err(PipelineError::filesystem(Stage::Upload, package_path))?;

        self.store
            .put(layout.result_key(), stream_file(file, layout.result_key()))
            .await
            .map_err(|source| PipelineError::ArtifactStore {
                stage: Stage::Upload,
                source,
            })?;

        info!(stage = %Stage::Upload, "Uploaded artifact {}", layout.result_key());
        Ok(())
    }
}
