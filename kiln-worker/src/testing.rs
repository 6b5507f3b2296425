//! Test doubles for the pipeline and consumer tests

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use kiln_client::{
    ArtifactStore, ByteStream, MessageAcker, ObjectStoreArtifacts, QueueError, StoreError,
    TaskMessage, TaskSource, stream_bytes,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::service::{
    ArchiveError, ArchiveService, BuildError, BuildOutput, BuildService, TarArchiver,
    TaskPipeline, WorkspaceSettings,
};

/// Gzipped tarball holding `<dir_name>/project.godot`
pub fn project_archive(dir_name: &str) -> Vec<u8> {
    let src = tempfile::tempdir().unwrap();
    let project = src.path().join(dir_name);
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("project.godot"), "config_version=5").unwrap();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_dir_all(dir_name, &project).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// In-memory artifact store that records every key it is asked for
pub struct CountingStore {
    inner: ObjectStoreArtifacts,
    fail_puts: bool,
    gets: Mutex<Vec<String>>,
    puts: Mutex<Vec<String>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreArtifacts::in_memory(),
            fail_puts: false,
            gets: Mutex::default(),
            puts: Mutex::default(),
        }
    }

    /// Store whose uploads are refused like an unreachable bucket
    pub fn rejecting_puts() -> Self {
        Self {
            fail_puts: true,
            ..Self::new()
        }
    }

    pub async fn seed(&self, key: &str, bytes: Vec<u8>) {
        self.inner.put(key, stream_bytes(bytes)).await.unwrap();
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for CountingStore {
    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        self.gets.lock().unwrap().push(key.to_string());
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: ByteStream) -> Result<(), StoreError> {
        self.puts.lock().unwrap().push(key.to_string());
        if self.fail_puts {
            return Err(StoreError::Upload {
                key: key.to_string(),
                source: std::io::Error::other("connection refused"),
            });
        }
        self.inner.put(key, body).await
    }
}

/// Real tar archiver with call counters
#[derive(Default)]
pub struct CountingArchiver {
    inner: TarArchiver,
    fail_create: bool,
    extracts: AtomicUsize,
    creates: AtomicUsize,
}

impl CountingArchiver {
    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveService for CountingArchiver {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(archive, destination).await
    }

    async fn create(&self, archive: &Path, source_dir: &Path) -> Result<(), ArchiveError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(ArchiveError::Io {
                path: archive.to_path_buf(),
                source: std::io::Error::other("no space left on device"),
            });
        }
        self.inner.create(archive, source_dir).await
    }
}

/// What the fake builder does once invoked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildBehavior {
    #[default]
    Succeed,
    /// Fails like a broken export preset
    Fail,
    Panic,
}

/// Builder that writes `index.html`, fails or panics
#[derive(Default)]
pub struct FakeBuilder {
    behavior: BuildBehavior,
    profiles: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn profiles(&self) -> Vec<String> {
        self.profiles.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildService for FakeBuilder {
    async fn build(
        &self,
        project_dir: &Path,
        profile: &str,
        output_dir: &Path,
    ) -> Result<BuildOutput, BuildError> {
        self.profiles.lock().unwrap().push(profile.to_string());
        assert!(project_dir.join("project.godot").is_file());

        match self.behavior {
            BuildBehavior::Succeed => {}
            BuildBehavior::Fail => {
                return Err(BuildError::Failed {
                    exit_code: Some(1),
                    output: format!("ERROR: missing export preset '{}'", profile),
                });
            }
            BuildBehavior::Panic => panic!("builder blew up"),
        }

        std::fs::write(output_dir.join("index.html"), format!("exported {}", profile)).unwrap();
        Ok(BuildOutput {
            output: "export ok".to_string(),
        })
    }
}

/// Pipeline wired to test doubles and a private work root
pub struct Harness {
    _dir: TempDir,
    work_root: PathBuf,
    pub store: Arc<CountingStore>,
    pub archiver: Arc<CountingArchiver>,
    pub builder: Arc<FakeBuilder>,
}

impl Harness {
    pub fn new() -> Self {
        Self::assemble(
            CountingStore::new(),
            CountingArchiver::default(),
            BuildBehavior::Succeed,
        )
    }

    pub fn failing_build() -> Self {
        Self::assemble(
            CountingStore::new(),
            CountingArchiver::default(),
            BuildBehavior::Fail,
        )
    }

    pub fn panicking_build() -> Self {
        Self::assemble(
            CountingStore::new(),
            CountingArchiver::default(),
            BuildBehavior::Panic,
        )
    }

    /// Packaging fails after a successful build
    pub fn failing_package() -> Self {
        let archiver = CountingArchiver {
            fail_create: true,
            ..CountingArchiver::default()
        };
        Self::assemble(CountingStore::new(), archiver, BuildBehavior::Succeed)
    }

    /// Everything succeeds until the artifact upload
    pub fn failing_upload() -> Self {
        Self::assemble(
            CountingStore::rejecting_puts(),
            CountingArchiver::default(),
            BuildBehavior::Succeed,
        )
    }

    fn assemble(store: CountingStore, archiver: CountingArchiver, behavior: BuildBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work_root = dir.path().join("work");
        Self {
            _dir: dir,
            work_root,
            store: Arc::new(store),
            archiver: Arc::new(archiver),
            builder: Arc::new(FakeBuilder {
                behavior,
                ..FakeBuilder::default()
            }),
        }
    }

    /// Run directories left under the work root
    pub fn leftover_runs(&self) -> usize {
        match std::fs::read_dir(&self.work_root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    pub async fn seed(&self, key: &str, bytes: Vec<u8>) {
        self.store.seed(key, bytes).await;
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn pipeline(&self) -> TaskPipeline {
        TaskPipeline::new(
            self.store.clone(),
            self.archiver.clone(),
            self.builder.clone(),
            WorkspaceSettings {
                work_root: self.work_root.clone(),
                keep_run_dirs: false,
            },
        )
    }
}

/// How a message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// Shared log of settlements across messages
#[derive(Debug, Clone, Default)]
pub struct SettleLog(Arc<Mutex<Vec<(String, Settlement)>>>);

impl SettleLog {
    pub fn entries(&self) -> Vec<(String, Settlement)> {
        self.0.lock().unwrap().clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.entries().into_iter().map(|(_, s)| s).collect()
    }

    /// Builds a message whose settlement is recorded under `label`
    pub fn message(&self, label: &str, payload: &[u8], delivery_count: Option<u32>) -> TaskMessage {
        TaskMessage::new(
            payload.to_vec(),
            delivery_count,
            RecordingAcker {
                label: label.to_string(),
                log: self.clone(),
            },
        )
    }
}

struct RecordingAcker {
    label: String,
    log: SettleLog,
}

#[async_trait]
impl MessageAcker for RecordingAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.log
            .0
            .lock()
            .unwrap()
            .push((self.label.clone(), Settlement::Ack));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.log
            .0
            .lock()
            .unwrap()
            .push((self.label.clone(), Settlement::Nack { requeue }));
        Ok(())
    }
}

/// Task source replaying a fixed list of messages
pub struct VecSource {
    messages: VecDeque<Result<TaskMessage, QueueError>>,
    hold_open: bool,
}

impl VecSource {
    /// Source that closes after the last message
    pub fn new(messages: Vec<TaskMessage>) -> Self {
        Self {
            messages: messages.into_iter().map(Ok).collect(),
            hold_open: false,
        }
    }

    /// Source that stays open (never yields) after the last message
    pub fn held_open(messages: Vec<TaskMessage>) -> Self {
        Self {
            hold_open: true,
            ..Self::new(messages)
        }
    }

    pub fn push_error(&mut self, error: QueueError) {
        self.messages.push_back(Err(error));
    }
}

#[async_trait]
impl TaskSource for VecSource {
    async fn next_message(&mut self) -> Option<Result<TaskMessage, QueueError>> {
        match self.messages.pop_front() {
            Some(next) => Some(next),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }
}
