//! Best-effort per-agent stream log.
//!
//! Raw child output is appended verbatim as it arrives, with coordinator
//! annotations interleaved inline. Every write error is swallowed: losing
//! observability must never disturb a running agent.

use std::path::Path;

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::types::Complexity;

#[derive(Debug)]
pub struct StreamLog {
    file: Option<File>,
}

impl StreamLog {
    /// Open the log and write the admission header. Returns a disabled log on
    /// any error.
    pub async fn create(path: &Path, request_id: &str, role: &str, class: Complexity) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .ok();
        let mut log = Self { file };
        let header = format!(
            "=== swarm agent {request_id} ===\nrole: {role}\ncomplexity: {class}\nstarted: {}\n\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        );
        log.write(header.as_bytes()).await;
        log
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub async fn chunk(&mut self, bytes: &[u8]) {
        self.write(bytes).await;
    }

    pub async fn note(&mut self, msg: &str) {
        self.write(format!("\n[COORDINATOR {msg}]\n").as_bytes()).await;
    }

    pub async fn warn(&mut self, msg: &str) {
        self.write(format!("\n[COORDINATOR WARNING {msg}]\n").as_bytes())
            .await;
    }

    pub async fn footer(&mut self, status: &str, duration_ms: u64) {
        let footer = format!(
            "\n=== finished: {status} after {duration_ms}ms at {} ===\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        );
        self.write(footer.as_bytes()).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(bytes).await;
            let _ = file.flush().await;
        }
    }
}
