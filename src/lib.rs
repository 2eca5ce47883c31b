//! swarmd: local process-supervision coordinator for LLM CLI agents.
//!
//! Requests arrive as JSON files in a spool directory; each accepted request
//! becomes a supervised child process with a health probe, a progressive
//! deadline, and a heartbeat/silence detector. Results are written back to
//! the spool as JSON records.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod probe;
pub mod shaper;
pub mod spool;
pub mod stats;
pub mod types;
pub mod watcher;
