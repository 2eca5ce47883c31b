//! Request and result data model.
//!
//! Inbound requests are UTF-8 JSON dropped into the spool's `requests/`
//! directory; result records are written to `results/{requestId}.json`.
//! Field names on the wire are camelCase.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The task payload of a request. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// An inbound agent request.
///
/// Unknown top-level keys are captured in `extra` so they survive into the
/// side-context file; they are otherwise ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    #[serde(default)]
    pub task: TaskSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    pub fn role(&self) -> &str {
        self.agent_role.as_deref().unwrap_or("worker")
    }
}

/// Complexity class derived from the request text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Deterministic classification of a request; see the shaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: Complexity,
    pub score: u32,
    pub initial_deadline: Duration,
    pub max_deadline: Duration,
}

/// Character accounting for the context-size analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAnalysis {
    pub objective_chars: usize,
    pub context_chars: usize,
    pub requirement_chars: usize,
    pub exceeds_inline: bool,
}

/// Terminal status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Why the coordinator ended a run early. Absent for natural exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    HealthCheckFailed,
    ProgressiveTimeout,
    HeartbeatTimeout,
    Shutdown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HealthCheckFailed => write!(f, "HEALTH_CHECK_FAILED"),
            Self::ProgressiveTimeout => write!(f, "PROGRESSIVE_TIMEOUT"),
            Self::HeartbeatTimeout => write!(f, "HEARTBEAT_TIMEOUT"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Per-run statistics embedded in the result record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub health_check_ms: Option<u64>,
    pub startup_latency_ms: Option<u64>,
    pub complexity: Complexity,
    pub complexity_score: u32,
    pub extensions_applied: u32,
    pub output_bursts: u64,
    pub total_output_bytes: u64,
    pub used_lazy_context: bool,
    pub context_loaded_from_file: bool,
    pub silence_warnings: u32,
}

/// The record written once to `results/{requestId}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub request_id: String,
    pub status: RunStatus,
    pub output: String,
    pub duration_ms: u64,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub agent_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    pub completed_at: String,
    pub stats: RunStats,
}

/// Truncate `s` to at most `max` bytes, respecting char boundaries.
pub fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
