//! Process-wide monotonic tallies.
//!
//! One instance per coordinator, shared by every supervision task. All
//! counters are relaxed atomics; a snapshot is taken for the periodic status
//! line and for tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SwarmStats {
    completed: AtomicU64,
    failed: AtomicU64,
    health_checks_passed: AtomicU64,
    health_checks_failed: AtomicU64,
    lazy_context_used: AtomicU64,
    full_context_used: AtomicU64,
    timeout_extensions: AtomicU64,
    early_timeouts: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    silence_warnings: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub lazy_context_used: u64,
    pub full_context_used: u64,
    pub timeout_extensions: u64,
    pub early_timeouts: u64,
    pub heartbeat_timeouts: u64,
    pub silence_warnings: u64,
}

impl SwarmStats {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self, passed: bool) {
        if passed {
            self.health_checks_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_context_mode(&self, lazy: bool) {
        if lazy {
            self.lazy_context_used.fetch_add(1, Ordering::Relaxed);
        } else {
            self.full_context_used.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_extension(&self) {
        self.timeout_extensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_timeout(&self) {
        self.early_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_silence_warning(&self) {
        self.silence_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            health_checks_passed: self.health_checks_passed.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
            lazy_context_used: self.lazy_context_used.load(Ordering::Relaxed),
            full_context_used: self.full_context_used.load(Ordering::Relaxed),
            timeout_extensions: self.timeout_extensions.load(Ordering::Relaxed),
            early_timeouts: self.early_timeouts.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            silence_warnings: self.silence_warnings.load(Ordering::Relaxed),
        }
    }
}
