//! The on-disk spool: directory layout and the rename-based claim protocol.
//!
//! The claim rename is the only serialization point against duplicate
//! processing: a file that made it into `processing/` is owned by exactly one
//! intake path. `std::fs::rename` replaces existing targets on unix, so the
//! claim checks the target first; this is adequate under the one-coordinator-
//! per-spool assumption.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SpoolDirs {
    pub root: PathBuf,
    pub requests: PathBuf,
    pub processing: PathBuf,
    pub results: PathBuf,
    pub logs: PathBuf,
    pub context: PathBuf,
}

impl SpoolDirs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            requests: root.join("requests"),
            processing: root.join("processing"),
            results: root.join("results"),
            logs: root.join("logs"),
            context: root.join("context"),
            root,
        }
    }

    /// Create the whole tree. Fatal at startup: any failure here aborts.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.requests,
            &self.processing,
            &self.results,
            &self.logs,
            &self.context,
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::SpoolSetup(format!("{}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn result_path(&self, request_id: &str) -> PathBuf {
        self.results.join(format!("{request_id}.json"))
    }

    pub fn log_path(&self, request_id: &str) -> PathBuf {
        self.logs.join(format!("{request_id}.log"))
    }

    pub fn context_path(&self, request_id: &str) -> PathBuf {
        self.context.join(format!("{request_id}.json"))
    }

    /// Atomically claim `requests/{name}` by renaming it into `processing/`.
    ///
    /// Returns the processing path on success. `None` means another path owns
    /// the file (target exists) or the source vanished first.
    pub async fn claim(&self, name: &str) -> Option<PathBuf> {
        let source = self.requests.join(name);
        let target = self.processing.join(name);
        if fs::try_exists(&target).await.unwrap_or(false) {
            return None;
        }
        match fs::rename(&source, &target).await {
            Ok(()) => Some(target),
            Err(_) => None,
        }
    }

    /// Return a claimed file to the inbox so it gets re-picked-up later.
    pub async fn restore(&self, name: &str) {
        let source = self.processing.join(name);
        let target = self.requests.join(name);
        if let Err(e) = fs::rename(&source, &target).await {
            warn!(file = name, error = %e, "failed to restore request to inbox");
        }
    }

    /// Remove a claimed file once the supervisor owns the request in memory.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            warn!(file = %path.display(), error = %e, "failed to remove processing file");
        }
    }
}
