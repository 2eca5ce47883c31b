//! The coordinator: admission gate, live-agent registry, and the intake
//! pipeline connecting the spool watcher to per-agent supervision tasks.

pub mod agent;
pub mod prompt;
pub mod stream_log;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::events::{CoordinatorEvent, EventBus};
use crate::spool::SpoolDirs;
use crate::stats::{StatsSnapshot, SwarmStats};
use crate::types::Request;
use crate::watcher;

use agent::SupervisorDeps;

/// How often the coordinator logs a tally snapshot.
const STATUS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Admission gate
// ---------------------------------------------------------------------------

/// Bounded-concurrency gate. `try_reserve` either hands out a scope-bound
/// permit or reports "queue full"; never an error.
#[derive(Debug)]
pub struct AdmissionGate {
    active: AtomicUsize,
    max_concurrent: usize,
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max_concurrent,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn can_spawn(&self) -> bool {
        self.active() < self.max_concurrent
    }

    pub fn try_reserve(self: &Arc<Self>) -> Option<SlotPermit> {
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.max_concurrent {
                    Some(n + 1)
                } else {
                    None
                }
            });
        reserved.ok().map(|_| SlotPermit {
            gate: Arc::clone(self),
        })
    }
}

/// Releases its slot on drop, after the result record is on disk.
#[derive(Debug)]
pub struct SlotPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    cfg: Arc<Config>,
    dirs: Arc<SpoolDirs>,
    stats: Arc<SwarmStats>,
    events: EventBus,
    gate: Arc<AdmissionGate>,
    /// request id → per-agent cancellation token, for shutdown kills.
    live: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Prepare the spool, scan the inbox once, and start watching. Fails only
    /// on spool-setup errors; everything after this point recovers locally.
    pub async fn start(cfg: Config) -> Result<Self> {
        let cfg = Arc::new(cfg);
        let dirs = Arc::new(SpoolDirs::new(&cfg.swarm_dir));
        dirs.prepare().await?;

        let stats = Arc::new(SwarmStats::default());
        let events = EventBus::new();
        let gate = Arc::new(AdmissionGate::new(cfg.max_concurrent_agents));
        let live = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let watcher_task = watcher::spawn(
            Arc::clone(&dirs),
            cfg.poll_interval,
            shutdown.clone(),
            intake_tx,
        );

        let mut coordinator = Self {
            cfg,
            dirs,
            stats,
            events,
            gate,
            live,
            shutdown,
            tasks: Vec::new(),
        };
        let intake_task = coordinator.spawn_intake_loop(intake_rx);
        let status_task = coordinator.spawn_status_loop();
        coordinator.tasks = vec![watcher_task, intake_task, status_task];

        info!(
            spool = %coordinator.dirs.root.display(),
            max_concurrent = coordinator.cfg.max_concurrent_agents,
            agent_cmd = %coordinator.cfg.agent_cmd,
            context_mode = %coordinator.cfg.context_mode,
            "coordinator started"
        );
        Ok(coordinator)
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_agents(&self) -> usize {
        self.gate.active()
    }

    /// Stop the watcher, signal every live agent (`reason = SHUTDOWN`), and
    /// wait a short grace for their close events. Pending result records are
    /// best-effort.
    pub async fn shutdown(&self) {
        info!(live = self.live.len(), "shutting down");
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_grace;
        while !self.live.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        for task in &self.tasks {
            task.abort();
        }
        info!(remaining = self.live.len(), "shutdown complete");
    }

    fn deps(&self) -> SupervisorDeps {
        SupervisorDeps {
            cfg: Arc::clone(&self.cfg),
            dirs: Arc::clone(&self.dirs),
            stats: Arc::clone(&self.stats),
            events: self.events.clone(),
        }
    }

    /// One consumer for both intake paths (notify events and the poll). The
    /// routine is idempotent: the claim rename is the serialization point.
    fn spawn_intake_loop(&self, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let cfg = Arc::clone(&self.cfg);
        let dirs = Arc::clone(&self.dirs);
        let gate = Arc::clone(&self.gate);
        let live = Arc::clone(&self.live);
        let shutdown = self.shutdown.clone();
        let deps = self.deps();
        let seen: Arc<DashSet<String>> = Arc::new(DashSet::new());

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    name = rx.recv() => match name {
                        Some(name) => name,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                intake_one(&cfg, &dirs, &gate, &live, &seen, &deps, &shutdown, name).await;
            }
        })
    }

    fn spawn_status_loop(&self) -> JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let gate = Arc::clone(&self.gate);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(
                tokio::time::Instant::now() + STATUS_LOG_INTERVAL,
                STATUS_LOG_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snap = stats.snapshot();
                        info!(
                            active = gate.active(),
                            completed = snap.completed,
                            failed = snap.failed,
                            extensions = snap.timeout_extensions,
                            heartbeat_timeouts = snap.heartbeat_timeouts,
                            "status"
                        );
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Process one candidate file name from `requests/`. Safe to call any number
/// of times for the same name.
#[allow(clippy::too_many_arguments)]
async fn intake_one(
    cfg: &Arc<Config>,
    dirs: &Arc<SpoolDirs>,
    gate: &Arc<AdmissionGate>,
    live: &Arc<DashMap<String, CancellationToken>>,
    seen: &Arc<DashSet<String>>,
    deps: &SupervisorDeps,
    shutdown: &CancellationToken,
    name: String,
) {
    if !name.ends_with(".json") {
        return;
    }
    let inbox_path = dirs.requests.join(&name);

    let raw = match tokio::fs::read_to_string(&inbox_path).await {
        Ok(raw) => raw,
        // vanished or unreadable: another path already has it
        Err(_) => return,
    };

    let mut req: Request = match serde_json::from_str(&raw) {
        Ok(req) => req,
        Err(e) => {
            // unrecoverable; leaving it would reprocess forever
            warn!(file = %name, error = %e, "deleting malformed request file");
            let _ = tokio::fs::remove_file(&inbox_path).await;
            return;
        }
    };

    let request_id = match req.request_id.clone() {
        Some(id) => id,
        None => {
            let id = synthesize_request_id();
            req.request_id = Some(id.clone());
            id
        }
    };

    let Some(processing_path) = dirs.claim(&name).await else {
        return;
    };

    if seen.contains(&request_id) {
        warn!(request_id = %request_id, file = %name, "duplicate request id, discarding");
        dirs.discard(&processing_path).await;
        return;
    }

    let Some(permit) = gate.try_reserve() else {
        debug!(request_id = %request_id, "queue full, restoring request");
        let dirs = Arc::clone(dirs);
        let delay = cfg.restore_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dirs.restore(&name).await;
        });
        return;
    };

    // Accepted: the in-memory context takes over from the spool copy.
    seen.insert(request_id.clone());
    dirs.discard(&processing_path).await;

    let cancel = shutdown.child_token();
    live.insert(request_id.clone(), cancel.clone());

    let deps = deps.clone();
    let live = Arc::clone(live);
    tokio::spawn(async move {
        agent::supervise(deps, req, request_id.clone(), cancel).await;
        live.remove(&request_id);
        drop(permit);
    });
}

/// `req-{epoch-millis}-{6 base36 chars}`; unique with overwhelming
/// probability and never colliding with in-flight ids.
fn synthesize_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect();
    format!("req-{millis}-{suffix}")
}
