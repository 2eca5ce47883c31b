//! Health probe: a short-lived child invocation that proves the agent binary
//! can start and emit a token before the full task budget is committed.
//!
//! The probe child is asked to print exactly `READY`; the first stdout chunk
//! containing that token passes. Dead-on-arrival binaries fail here in
//! `health_check_timeout` instead of burning a multi-minute task deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::types::truncate_at_boundary;

const READY_TOKEN: &str = "READY";
const PROBE_PROMPT: &str =
    "This is a startup health check. Respond with exactly the word READY and nothing else.";
const FAILURE_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub duration: Duration,
    /// "ok", "timeout", or up to 200 chars of whatever the child produced.
    pub detail: String,
    pub exit_code: Option<i32>,
}

impl ProbeOutcome {
    fn passed(duration: Duration) -> Self {
        Self {
            passed: true,
            duration,
            detail: "ok".to_string(),
            exit_code: None,
        }
    }
}

/// Run the probe. Synchronous from the supervisor's point of view: the task
/// child is only spawned after this returns a pass.
pub async fn run_health_check(cfg: &Config, request_id: &str) -> ProbeOutcome {
    if cfg.skip_health_check {
        return ProbeOutcome {
            passed: true,
            duration: Duration::ZERO,
            detail: "skipped".to_string(),
            exit_code: None,
        };
    }

    let started = Instant::now();
    let deadline = started + cfg.health_check_timeout;

    let mut child = match Command::new(&cfg.agent_cmd)
        .args(&cfg.agent_args)
        .env("SWARM_REQUEST_ID", format!("health-{request_id}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ProbeOutcome {
                passed: false,
                duration: started.elapsed(),
                detail: format!("spawn failed: {e}"),
                exit_code: Some(-1),
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(PROBE_PROMPT.as_bytes()).await;
        // dropping closes the pipe so the child sees EOF
    }

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        return ProbeOutcome {
            passed: false,
            duration: started.elapsed(),
            detail: "stdout pipe unavailable".to_string(),
            exit_code: Some(-1),
        };
    };

    let mut collected = String::new();
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await;
        match read {
            // deadline expired before READY
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return ProbeOutcome {
                    passed: false,
                    duration: started.elapsed(),
                    detail: "timeout".to_string(),
                    exit_code: None,
                };
            }
            // child closed stdout before READY
            Ok(Ok(0)) | Ok(Err(_)) => {
                let mut stderr_tail = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    let mut ebuf = Vec::new();
                    let _ = tokio::time::timeout(
                        Duration::from_millis(250),
                        stderr.read_to_end(&mut ebuf),
                    )
                    .await;
                    stderr_tail = String::from_utf8_lossy(&ebuf).to_string();
                }
                let status = child.wait().await.ok();
                let exit_code = status.and_then(|s| s.code());
                let combined = format!("{collected}{stderr_tail}");
                let detail = truncate_at_boundary(combined.trim(), FAILURE_DETAIL_CHARS);
                return ProbeOutcome {
                    passed: false,
                    duration: started.elapsed(),
                    detail: if detail.is_empty() {
                        "exited before READY".to_string()
                    } else {
                        detail.to_string()
                    },
                    exit_code,
                };
            }
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains(READY_TOKEN) {
                    debug!(request_id, elapsed_ms = started.elapsed().as_millis() as u64, "health check passed");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return ProbeOutcome::passed(started.elapsed());
                }
            }
        }
    }
}
