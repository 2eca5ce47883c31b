//! Typed coordinator event surface.
//!
//! Observers subscribe to a broadcast channel; internal consumers are limited
//! to counter bumps, so nothing blocks on a slow subscriber (sends to a
//! receiver-less channel are simply dropped).

use tokio::sync::broadcast;

use crate::types::FailureReason;

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Child exited 0 and the result record was written.
    AgentComplete { request_id: String, duration_ms: u64 },
    /// Spawn error or non-zero natural exit.
    AgentError { request_id: String, error: String },
    /// Coordinator-initiated termination (deadline, heartbeat, shutdown).
    AgentKilled {
        request_id: String,
        reason: FailureReason,
    },
    /// Deadline grew because the agent kept producing near expiry.
    TimeoutExtended {
        request_id: String,
        new_deadline_ms: u64,
        extensions: u32,
    },
    /// Soft silence threshold crossed (once per silent stretch).
    SilenceWarning { request_id: String, silence_ms: u64 },
    /// Probe failed; the task child was never spawned.
    HealthCheckFailed { request_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
