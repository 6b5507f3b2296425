//! Archive service
//!
//! Unpacks fetched project archives and packages build output.
//! Extraction accepts plain or gzip-compressed tarballs; packaging always
//! writes `.tar.gz`. The tar work runs on the blocking thread pool.

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading or writing archives
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive did not contain expected directory {}", path.display())]
    MissingEntry { path: PathBuf },

    #[error("archive worker stopped unexpectedly: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Service trait for archive handling
#[async_trait]
pub trait ArchiveService: Send + Sync {
    /// Extracts `archive` into `destination`
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError>;

    /// Writes the contents of `source_dir` (not the directory itself) into a
    /// new gzip-compressed tarball at `archive`
    async fn create(&self, archive: &Path, source_dir: &Path) -> Result<(), ArchiveError>;
}

/// Tarball implementation of ArchiveService
#[derive(Debug, Default, Clone)]
pub struct TarArchiver;

impl TarArchiver {
    /// Creates a new tar archiver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveService for TarArchiver {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || unpack(&archive, &destination)).await?
    }

    async fn create(&self, archive: &Path, source_dir: &Path) -> Result<(), ArchiveError> {
        let archive = archive.to_path_buf();
        let source_dir = source_dir.to_path_buf();

        tokio::task::spawn_blocking(move || pack(&archive, &source_dir)).await?
    }
}

fn unpack(archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    };

    let mut file = File::open(archive).map_err(io_err)?;
    let compressed = is_gzip(&mut file).map_err(io_err)?;
    let reader = BufReader::new(file);

    debug!(
        "Extracting {} ({}) into {}",
        archive.display(),
        if compressed { "gzip" } else { "tar" },
        destination.display()
    );

    // `unpack` refuses entries that would land outside `destination`
    if compressed {
        tar::Archive::new(GzDecoder::new(reader))
            .unpack(destination)
            .map_err(io_err)
    } else {
        tar::Archive::new(reader)
            .unpack(destination)
            .map_err(io_err)
    }
}

fn pack(archive: &Path, source_dir: &Path) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    };

    debug!(
        "Packaging {} into {}",
        source_dir.display(),
        archive.display()
    );

    let file = File::create(archive).map_err(io_err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(".", source_dir).map_err(|source| ArchiveError::Io {
        path: source_dir.to_path_buf(),
        source,
    })?;

    let encoder = builder.into_inner().map_err(io_err)?;
    encoder.finish().map_err(io_err)?;
    Ok(())
}

/// Sniffs the gzip magic number and rewinds the file
fn is_gzip(file: &mut File) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(read == magic.len() && magic == [0x1f, 0x8b])
}
