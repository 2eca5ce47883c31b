//! Coordinator configuration.
//!
//! Everything is read once at startup from environment variables; the
//! defaults below are the documented defaults. A handful of knobs (the
//! extension proximity window, the progress-log cadence, the restore delay)
//! have no environment variable and exist so tests can compress timescales.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How request context is delivered to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Spill oversized context to a side file and hand the child a pointer.
    Lazy,
    /// Always inline the full context into the prompt.
    Full,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lazy => write!(f, "lazy"),
            Self::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Spool root; the five subdirectories live under it.
    pub swarm_dir: PathBuf,
    /// Admission ceiling.
    pub max_concurrent_agents: usize,
    /// Watcher poll cadence.
    pub poll_interval: Duration,
    /// Health probe deadline.
    pub health_check_timeout: Duration,
    /// Skip the probe entirely (synthetic pass, zero duration).
    pub skip_health_check: bool,
    /// Lazy vs full context delivery.
    pub context_mode: ContextMode,
    /// Requirements inlined into a lazy prompt.
    pub max_essential_requirements: usize,
    /// Serialized-context size above which lazy mode spills.
    pub max_inline_context_chars: usize,
    /// Deadline for the `simple` class; moderate/complex scale it.
    pub initial_timeout: Duration,
    /// Upper deadline cap shared by all classes.
    pub max_timeout: Duration,
    /// Extension increment.
    pub timeout_extension: Duration,
    /// Progress-predicate window.
    pub activity_window: Duration,
    /// Bursts required inside the window to count as progress.
    pub min_output_bursts: usize,
    /// Heartbeat tick.
    pub heartbeat_check_interval: Duration,
    /// Soft silence threshold (one warning).
    pub silence_warning: Duration,
    /// Hard silence kill threshold.
    pub heartbeat_timeout: Duration,
    /// Write per-agent stream logs.
    pub enable_incremental_files: bool,

    /// Child binary and its fixed arguments.
    pub agent_cmd: String,
    pub agent_args: Vec<String>,

    /// Delay before a quota-rejected request is restored to `requests/`.
    pub restore_delay: Duration,
    /// Extensions are considered only when deadline remaining drops below this.
    pub extension_proximity: Duration,
    /// Cadence of the per-agent progress log line.
    pub progress_check_interval: Duration,
    /// Progress tick warns when silence exceeds this while the deadline is near.
    pub progress_silence_warn: Duration,
    /// "Deadline is near" threshold for the progress-tick warning.
    pub near_deadline_warn: Duration,
    /// How long shutdown waits for live agents to close.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            swarm_dir: PathBuf::from(".swarm"),
            max_concurrent_agents: 5,
            poll_interval: Duration::from_millis(1000),
            health_check_timeout: Duration::from_millis(15_000),
            skip_health_check: false,
            context_mode: ContextMode::Lazy,
            max_essential_requirements: 3,
            max_inline_context_chars: 500,
            initial_timeout: Duration::from_millis(60_000),
            max_timeout: Duration::from_millis(240_000),
            timeout_extension: Duration::from_millis(60_000),
            activity_window: Duration::from_millis(30_000),
            min_output_bursts: 2,
            heartbeat_check_interval: Duration::from_millis(15_000),
            silence_warning: Duration::from_millis(45_000),
            heartbeat_timeout: Duration::from_millis(90_000),
            enable_incremental_files: true,
            agent_cmd: "claude".to_string(),
            agent_args: vec!["--print".to_string()],
            restore_delay: Duration::from_millis(2000),
            extension_proximity: Duration::from_millis(30_000),
            progress_check_interval: Duration::from_millis(15_000),
            progress_silence_warn: Duration::from_millis(30_000),
            near_deadline_warn: Duration::from_millis(45_000),
            shutdown_grace: Duration::from_millis(3000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            swarm_dir: env::var("SWARM_DIR").map(PathBuf::from).unwrap_or(d.swarm_dir),
            max_concurrent_agents: env_usize("MAX_CONCURRENT_AGENTS", d.max_concurrent_agents),
            poll_interval: env_ms("POLL_INTERVAL_MS", d.poll_interval),
            health_check_timeout: env_ms("HEALTH_CHECK_TIMEOUT_MS", d.health_check_timeout),
            skip_health_check: env_bool("SKIP_HEALTH_CHECK", d.skip_health_check),
            context_mode: match env::var("CONTEXT_MODE").as_deref() {
                Ok("full") => ContextMode::Full,
                _ => ContextMode::Lazy,
            },
            max_essential_requirements: env_usize(
                "MAX_ESSENTIAL_REQUIREMENTS",
                d.max_essential_requirements,
            ),
            max_inline_context_chars: env_usize(
                "MAX_INLINE_CONTEXT_CHARS",
                d.max_inline_context_chars,
            ),
            initial_timeout: env_ms("INITIAL_TIMEOUT_MS", d.initial_timeout),
            max_timeout: env_ms("MAX_TIMEOUT_MS", d.max_timeout),
            timeout_extension: env_ms("TIMEOUT_EXTENSION_MS", d.timeout_extension),
            activity_window: env_ms("ACTIVITY_WINDOW_MS", d.activity_window),
            min_output_bursts: env_usize("MIN_OUTPUT_BURSTS", d.min_output_bursts),
            heartbeat_check_interval: env_ms(
                "HEARTBEAT_CHECK_INTERVAL_MS",
                d.heartbeat_check_interval,
            ),
            silence_warning: env_ms("SILENCE_WARNING_MS", d.silence_warning),
            heartbeat_timeout: env_ms("HEARTBEAT_TIMEOUT_MS", d.heartbeat_timeout),
            enable_incremental_files: env_bool(
                "ENABLE_INCREMENTAL_FILES",
                d.enable_incremental_files,
            ),
            agent_cmd: env::var("SWARM_AGENT_CMD").unwrap_or(d.agent_cmd),
            agent_args: env::var("SWARM_AGENT_ARGS")
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or(d.agent_args),
            restore_delay: d.restore_delay,
            extension_proximity: d.extension_proximity,
            progress_check_interval: d.progress_check_interval,
            progress_silence_warn: d.progress_silence_warn,
            near_deadline_warn: d.near_deadline_warn,
            shutdown_grace: d.shutdown_grace,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
