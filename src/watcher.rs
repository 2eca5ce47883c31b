//! Spool watching: turn filesystem activity in `requests/` into intake
//! candidates exactly once.
//!
//! Two feeds run side by side: a `notify` watcher for create/rename events
//! and a fixed-interval poll, because some platforms coalesce or miss
//! events. Both send bare file names into the same channel; the intake
//! routine downstream is idempotent, and the claim rename dedupes.

use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::spool::SpoolDirs;

/// Start watching. The returned task runs until `shutdown` fires; the
/// `notify` watcher lives inside it and is dropped on exit.
pub(crate) fn spawn(
    dirs: Arc<SpoolDirs>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    intake_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // one synchronous pass over anything already waiting
        scan_inbox(&dirs, &intake_tx).await;

        let event_tx = intake_tx.clone();
        let _watcher = match start_notify_watcher(&dirs, event_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                // the poll still covers intake, just with more latency
                warn!(error = %e, "filesystem watcher unavailable, polling only");
                None
            }
        };

        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = poll.tick() => scan_inbox(&dirs, &intake_tx).await,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("spool watcher stopped");
    })
}

fn start_notify_watcher(
    dirs: &SpoolDirs,
    tx: mpsc::UnboundedSender<String>,
) -> notify::Result<notify::RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if name.ends_with(".json") {
                            let _ = tx.send(name.to_string());
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "filesystem watch event error"),
        })?;
    watcher.watch(&dirs.requests, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn scan_inbox(dirs: &SpoolDirs, tx: &mpsc::UnboundedSender<String>) {
    let mut entries = match tokio::fs::read_dir(&dirs.requests).await {
        Ok(entries) => entries,
        Err(e) => {
            // recoverable at steady state: log and try again next tick
            warn!(error = %e, "failed to scan request inbox");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".json") {
                let _ = tx.send(name.to_string());
            }
        }
    }
}
