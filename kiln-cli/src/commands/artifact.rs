//! Artifact command handlers
//!
//! Moves project archives into the object store and build artifacts out
//! of it. Bodies are streamed, never held in memory whole.

use anyhow::{Context, Result, anyhow};
use colored::*;
use futures::StreamExt;
use kiln_client::{ArtifactStore, ObjectStoreArtifacts, stream_file};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::Config;

/// Upload a local archive
pub async fn handle_upload(archive: &Path, key: Option<&str>, config: &Config) -> Result<()> {
    let store = ObjectStoreArtifacts::s3(&config.s3()).context("Failed to configure object store")?;

    let key = match key {
        Some(key) => key.to_string(),
        None => default_key(archive)?,
    };
    let bytes = upload(&store, archive, &key).await?;

    println!("{}", "✓ Archive uploaded".green().bold());
    println!("  Key:   {}", key.cyan());
    println!("  Store: {}", store.location().dimmed());
    println!("  Size:  {} bytes", bytes);
    println!();
    println!(
        "  Build it with: {}",
        format!("kiln submit --key {} --profile <profile>", key).dimmed()
    );

    Ok(())
}

/// Download an object to a local file
pub async fn handle_fetch(key: &str, output: Option<&Path>, config: &Config) -> Result<()> {
    let store = ObjectStoreArtifacts::s3(&config.s3()).context("Failed to configure object store")?;

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => default_output(key)?,
    };
    let bytes = fetch(&store, key, &output).await?;

    println!("{}", "✓ Object downloaded".green().bold());
    println!("  Key:  {}", key.cyan());
    println!("  File: {}", output.display());
    println!("  Size: {} bytes", bytes);

    Ok(())
}

async fn upload(store: &dyn ArtifactStore, archive: &Path, key: &str) -> Result<u64> {
    let file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let size = file.metadata().await?.len();

    store
        .put(key, stream_file(file, key))
        .await
        .with_context(|| format!("Failed to upload {}", key))?;

    Ok(size)
}

async fn fetch(store: &dyn ArtifactStore, key: &str, output: &Path) -> Result<u64> {
    let mut body = store.get(key).await.map_err(|e| {
        if e.is_not_found() {
            anyhow!("No object named '{}' in the store", key)
        } else {
            anyhow!(e).context(format!("Failed to download {}", key))
        }
    })?;

    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.with_context(|| format!("Failed to download {}", key))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

/// Object key for an archive uploaded without `--key`
fn default_key(archive: &Path) -> Result<String> {
    archive
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Cannot derive a key from {}", archive.display()))
}

/// Local file for an object fetched without `--output`
fn default_output(key: &str) -> Result<PathBuf> {
    key.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Cannot derive a file name from key '{}'", key))
}
