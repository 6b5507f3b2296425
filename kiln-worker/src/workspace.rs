//! Run workspace
//!
//! Each task runs in its own freshly created directory under the work root.
//! Runs release it with [`RunWorkspace::cleanup`], which removes it off the
//! async worker threads. Dropping a workspace that was never cleaned up
//! (panic, cancelled task) removes it synchronously.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scratch directory owned by one pipeline run
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: Uuid,
    root: PathBuf,
    keep: bool,
    released: bool,
}

impl RunWorkspace {
    /// Creates `work_root/run-<uuid>`
    ///
    /// # Arguments
    /// * `work_root` - Base directory shared by all runs of this worker
    /// * `keep` - Leave the directory in place when dropped
    pub async fn create(work_root: &Path, keep: bool) -> io::Result<Self> {
        let run_id = Uuid::new_v4();
        let root = work_root.join(format!("run-{}", run_id));

        tokio::fs::create_dir_all(&root).await?;
        debug!("Created run workspace {}", root.display());

        Ok(Self {
            run_id,
            root,
            keep,
            released: false,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Removes the directory (unless kept) without blocking the runtime
    pub async fn cleanup(mut self) {
        self.released = true;
        if self.keep {
            debug!("Keeping run workspace {}", self.root.display());
            return;
        }

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("Removed run workspace {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove run workspace {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.keep {
            debug!("Keeping run workspace {}", self.root.display());
            return;
        }

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Removed run workspace {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove run workspace {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}
