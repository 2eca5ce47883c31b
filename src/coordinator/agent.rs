//! Per-agent supervision: the state machine at the center of the coordinator.
//!
//! One tokio task owns the whole agent context. Every event (stdout/stderr
//! chunks, the deadline firing, heartbeat and progress ticks, shutdown) is
//! serialized through a single `select!` loop, so timer races cannot corrupt
//! state and the close path finalizes exactly once. Termination is a
//! cooperative SIGTERM; the child's close event releases the slot.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{CoordinatorEvent, EventBus};
use crate::probe;
use crate::shaper;
use crate::spool::SpoolDirs;
use crate::stats::SwarmStats;
use crate::types::{
    truncate_at_boundary, Classification, FailureReason, Request, ResultRecord, RunStats,
    RunStatus,
};

use super::prompt::{self, PromptPlan};
use super::stream_log::StreamLog;

/// Transcript cap; the result record's `output` field is bounded by this.
const MAX_TRANSCRIPT_CHARS: usize = 50_000;
/// Burst ring capacity. The progress predicate only inspects the activity
/// window, so evicting older entries is unobservable.
const BURST_LOG_CAP: usize = 512;

/// Shared dependencies handed to every supervision task.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub cfg: Arc<Config>,
    pub dirs: Arc<SpoolDirs>,
    pub stats: Arc<SwarmStats>,
    pub events: EventBus,
}

/// Mutable per-agent state. Owned exclusively by the supervision task.
struct AgentContext {
    request_id: String,
    started: Instant,
    first_output: Option<Instant>,
    last_heartbeat: Instant,
    deadline: Duration,
    max_deadline: Duration,
    extensions_applied: u32,
    transcript: String,
    total_output_bytes: u64,
    output_bursts: u64,
    bursts: VecDeque<(Instant, usize)>,
    silence_warned: bool,
    silence_warnings: u32,
    context_loaded_from_file: bool,
    kill_reason: Option<FailureReason>,
    terminated: bool,
}

impl AgentContext {
    fn new(request_id: String, classification: &Classification) -> Self {
        let now = Instant::now();
        Self {
            request_id,
            started: now,
            first_output: None,
            last_heartbeat: now,
            deadline: classification.initial_deadline,
            max_deadline: classification.max_deadline,
            extensions_applied: 0,
            transcript: String::new(),
            total_output_bytes: 0,
            output_bursts: 0,
            bursts: VecDeque::with_capacity(64),
            silence_warned: false,
            silence_warnings: 0,
            context_loaded_from_file: false,
            kill_reason: None,
            terminated: false,
        }
    }

    /// Record a stdout burst; returns true if this was the first output.
    fn record_burst(&mut self, len: usize) -> bool {
        let now = Instant::now();
        self.last_heartbeat = now;
        self.silence_warned = false;
        self.total_output_bytes += len as u64;
        self.output_bursts += 1;
        if self.bursts.len() == BURST_LOG_CAP {
            self.bursts.pop_front();
        }
        self.bursts.push_back((now, len));
        if self.first_output.is_none() {
            self.first_output = Some(now);
            return true;
        }
        false
    }

    fn append_transcript(&mut self, chunk: &str) {
        let remaining = MAX_TRANSCRIPT_CHARS.saturating_sub(self.transcript.len());
        if remaining > 0 {
            self.transcript.push_str(truncate_at_boundary(chunk, remaining));
        }
    }

    /// The progress predicate: a recent byte AND enough distinct bursts
    /// inside the activity window. Distinguishes a producing agent from one
    /// that emitted a single greeting and froze.
    fn showing_progress(&self, cfg: &Config) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_heartbeat) > cfg.activity_window {
            return false;
        }
        let in_window = self
            .bursts
            .iter()
            .rev()
            .take_while(|(t, _)| now.duration_since(*t) <= cfg.activity_window)
            .count();
        in_window >= cfg.min_output_bursts
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Drive one request from health probe to result record. The caller holds
/// the admission slot for the duration of this future.
pub async fn supervise(deps: SupervisorDeps, req: Request, request_id: String, cancel: CancellationToken) {
    let cfg = deps.cfg.as_ref();
    let classification = shaper::classify(&req, cfg);
    let analysis = shaper::analyze_context(&req, cfg);

    let mut stream_log = if cfg.enable_incremental_files {
        StreamLog::create(
            &deps.dirs.log_path(&request_id),
            &request_id,
            req.role(),
            classification.class,
        )
        .await
    } else {
        StreamLog::disabled()
    };

    info!(
        request_id = %request_id,
        role = req.role(),
        class = %classification.class,
        score = classification.score,
        deadline_ms = classification.initial_deadline.as_millis() as u64,
        "agent admitted"
    );

    // Phase one: prove the binary can start at all before committing the
    // full task budget.
    let probe_outcome = probe::run_health_check(cfg, &request_id).await;
    deps.stats.record_health_check(probe_outcome.passed);
    if !probe_outcome.passed {
        warn!(request_id = %request_id, detail = %probe_outcome.detail, "health check failed");
        stream_log
            .warn(&format!("health check failed: {}", probe_outcome.detail))
            .await;
        deps.events.emit(CoordinatorEvent::HealthCheckFailed {
            request_id: request_id.clone(),
            reason: probe_outcome.detail.clone(),
        });
        deps.stats.record_failed();
        let record = ResultRecord {
            request_id: request_id.clone(),
            status: RunStatus::Failed,
            output: probe_outcome.detail,
            duration_ms: probe_outcome.duration.as_millis() as u64,
            exit_code: probe_outcome.exit_code.unwrap_or(-1),
            failure_reason: Some(FailureReason::HealthCheckFailed),
            agent_role: req.role().to_string(),
            parent_request_id: req.parent_request_id.clone(),
            completed_at: chrono::Utc::now().to_rfc3339(),
            stats: RunStats {
                health_check_ms: Some(probe_outcome.duration.as_millis() as u64),
                startup_latency_ms: None,
                complexity: classification.class,
                complexity_score: classification.score,
                extensions_applied: 0,
                output_bursts: 0,
                total_output_bytes: 0,
                used_lazy_context: false,
                context_loaded_from_file: false,
                silence_warnings: 0,
            },
        };
        write_result(&deps, &record).await;
        stream_log.footer("failed", record.duration_ms).await;
        return;
    }

    // Phase two: the task child.
    let plan = prompt::build(&req, &analysis, cfg, &deps.dirs, &request_id).await;
    deps.stats.record_context_mode(plan.used_lazy);

    let mut child = match spawn_task_child(cfg, &req, &request_id, &plan) {
        Ok(child) => child,
        Err(message) => {
            error!(request_id = %request_id, error = %message, "task spawn failed");
            deps.events.emit(CoordinatorEvent::AgentError {
                request_id: request_id.clone(),
                error: message.clone(),
            });
            deps.stats.record_failed();
            let record = failure_record(
                &req,
                &request_id,
                &classification,
                &probe_outcome,
                &plan,
                message,
                0,
                -1,
                None,
            );
            write_result(&deps, &record).await;
            stream_log.footer("failed", 0).await;
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(plan.prompt.as_bytes()).await;
        // dropping closes stdin; the child sees EOF after the prompt
    }

    let mut ctx = AgentContext::new(request_id.clone(), &classification);
    run_loop(&deps, &mut ctx, &mut child, &plan, &cancel, &mut stream_log).await;

    // Close: the child has exited (naturally or after our SIGTERM). This is
    // the single finalization point.
    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!(request_id = %request_id, error = %e, "wait failed");
            -1
        }
    };

    let duration_ms = ctx.elapsed_ms();
    let status = if ctx.kill_reason.is_none() && exit_code == 0 {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };

    match status {
        RunStatus::Success => deps.stats.record_completed(),
        RunStatus::Failed => deps.stats.record_failed(),
    }

    let record = ResultRecord {
        request_id: request_id.clone(),
        status,
        output: ctx.transcript.clone(),
        duration_ms,
        exit_code,
        failure_reason: ctx.kill_reason,
        agent_role: req.role().to_string(),
        parent_request_id: req.parent_request_id.clone(),
        completed_at: chrono::Utc::now().to_rfc3339(),
        stats: RunStats {
            health_check_ms: Some(probe_outcome.duration.as_millis() as u64),
            startup_latency_ms: ctx
                .first_output
                .map(|t| t.duration_since(ctx.started).as_millis() as u64),
            complexity: classification.class,
            complexity_score: classification.score,
            extensions_applied: ctx.extensions_applied,
            output_bursts: ctx.output_bursts,
            total_output_bytes: ctx.total_output_bytes,
            used_lazy_context: plan.used_lazy,
            context_loaded_from_file: ctx.context_loaded_from_file,
            silence_warnings: ctx.silence_warnings,
        },
    };
    write_result(&deps, &record).await;
    stream_log
        .footer(
            match status {
                RunStatus::Success => "success",
                RunStatus::Failed => "failed",
            },
            duration_ms,
        )
        .await;

    match (status, ctx.kill_reason) {
        (RunStatus::Success, _) => {
            info!(request_id = %request_id, duration_ms, "agent completed");
            deps.events.emit(CoordinatorEvent::AgentComplete {
                request_id,
                duration_ms,
            });
        }
        // kill events were emitted when the signal was sent
        (RunStatus::Failed, Some(_)) => {}
        (RunStatus::Failed, None) => {
            warn!(request_id = %request_id, exit_code, duration_ms, "agent exited non-zero");
            deps.events.emit(CoordinatorEvent::AgentError {
                request_id,
                error: format!("exit code {exit_code}"),
            });
        }
    }

}

fn spawn_task_child(
    cfg: &Config,
    req: &Request,
    request_id: &str,
    plan: &PromptPlan,
) -> Result<Child, String> {
    let context_file = plan
        .context_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let context_mode = if plan.used_lazy { "lazy" } else { "full" };

    Command::new(&cfg.agent_cmd)
        .args(&cfg.agent_args)
        .env("SWARM_REQUEST_ID", request_id)
        .env("SWARM_PARENT_ID", req.parent_request_id.as_deref().unwrap_or(""))
        .env("SWARM_AGENT_ROLE", req.role())
        .env("SWARM_CONTEXT_FILE", context_file)
        .env("SWARM_CONTEXT_MODE", context_mode)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {e}", cfg.agent_cmd))
}

/// The four control loops: output reader (stdout + stderr), deadline timer,
/// heartbeat timer, progress timer. Runs until both pipes reach EOF.
async fn run_loop(
    deps: &SupervisorDeps,
    ctx: &mut AgentContext,
    child: &mut Child,
    plan: &PromptPlan,
    cancel: &CancellationToken,
    stream_log: &mut StreamLog,
) {
    let cfg = deps.cfg.as_ref();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_done = stdout.is_none();
    let mut stderr_done = stderr.is_none();

    let deadline_sleep = tokio::time::sleep(ctx.deadline);
    tokio::pin!(deadline_sleep);

    let mut heartbeat = interval_at(
        Instant::now() + cfg.heartbeat_check_interval,
        cfg.heartbeat_check_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut progress = interval_at(
        Instant::now() + cfg.progress_check_interval,
        cfg.progress_check_interval,
    );
    progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Sentinels that show the child actually consulted its side file.
    let sentinels: Vec<String> = plan
        .context_file
        .as_ref()
        .map(|p| {
            let mut v = vec![p.display().to_string()];
            if let Some(name) = p.file_name() {
                v.push(name.to_string_lossy().to_string());
            }
            v
        })
        .unwrap_or_default();

    let mut obuf = [0u8; 8192];
    let mut ebuf = [0u8; 8192];

    while !(stdout_done && stderr_done) {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut obuf), if !stdout_done => {
                if n == 0 {
                    stdout_done = true;
                } else {
                    let first = ctx.record_burst(n);
                    let chunk = String::from_utf8_lossy(&obuf[..n]).to_string();
                    ctx.append_transcript(&chunk);
                    if first {
                        debug!(
                            request_id = %ctx.request_id,
                            startup_latency_ms = ctx.elapsed_ms(),
                            "first output"
                        );
                    }
                    if !ctx.context_loaded_from_file
                        && sentinels.iter().any(|s| chunk.contains(s.as_str()))
                    {
                        ctx.context_loaded_from_file = true;
                        debug!(request_id = %ctx.request_id, "child loaded side context file");
                    }
                    stream_log.chunk(&obuf[..n]).await;
                    check_extension(deps, ctx, cfg, deadline_sleep.as_mut(), stream_log).await;
                }
            }
            n = read_chunk(&mut stderr, &mut ebuf), if !stderr_done => {
                if n == 0 {
                    stderr_done = true;
                } else {
                    ctx.last_heartbeat = Instant::now();
                    ctx.silence_warned = false;
                    stream_log.chunk(&ebuf[..n]).await;
                }
            }
            () = &mut deadline_sleep, if !ctx.terminated => {
                if ctx.extensions_applied == 0 {
                    deps.stats.record_early_timeout();
                }
                terminate(deps, ctx, child, FailureReason::ProgressiveTimeout, stream_log).await;
            }
            _ = heartbeat.tick(), if !ctx.terminated => {
                heartbeat_tick(deps, ctx, child, cfg, stream_log).await;
            }
            _ = progress.tick() => {
                progress_tick(ctx, cfg, stream_log).await;
            }
            _ = cancel.cancelled(), if !ctx.terminated => {
                terminate(deps, ctx, child, FailureReason::Shutdown, stream_log).await;
            }
        }
    }
}

/// Read from an optional child pipe; pends forever when the pipe is absent so
/// a disabled select arm never resolves. EOF and read errors both return 0.
async fn read_chunk<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> usize
where
    R: tokio::io::AsyncRead + Unpin,
{
    match pipe.as_mut() {
        Some(r) => r.read(buf).await.unwrap_or(0),
        None => std::future::pending().await,
    }
}

/// Extension check, stdout handler only. Grants more budget when the agent is
/// demonstrably producing and the deadline is near.
async fn check_extension(
    deps: &SupervisorDeps,
    ctx: &mut AgentContext,
    cfg: &Config,
    mut deadline_sleep: std::pin::Pin<&mut tokio::time::Sleep>,
    stream_log: &mut StreamLog,
) {
    if ctx.terminated {
        return;
    }
    let elapsed = ctx.started.elapsed();
    let remaining = ctx.deadline.saturating_sub(elapsed);
    if remaining > cfg.extension_proximity {
        return;
    }
    if elapsed >= ctx.max_deadline {
        return;
    }
    if !ctx.showing_progress(cfg) {
        return;
    }

    let new_deadline = (ctx.deadline + cfg.timeout_extension).min(ctx.max_deadline);
    if new_deadline == ctx.deadline {
        return;
    }
    ctx.deadline = new_deadline;
    ctx.extensions_applied += 1;
    deps.stats.record_extension();
    deadline_sleep.as_mut().reset(ctx.started + new_deadline);

    let new_deadline_ms = new_deadline.as_millis() as u64;
    info!(
        request_id = %ctx.request_id,
        new_deadline_ms,
        extensions = ctx.extensions_applied,
        "deadline extended"
    );
    stream_log
        .note(&format!(
            "deadline extended to {new_deadline_ms}ms (extension #{})",
            ctx.extensions_applied
        ))
        .await;
    deps.events.emit(CoordinatorEvent::TimeoutExtended {
        request_id: ctx.request_id.clone(),
        new_deadline_ms,
        extensions: ctx.extensions_applied,
    });
}

async fn heartbeat_tick(
    deps: &SupervisorDeps,
    ctx: &mut AgentContext,
    child: &mut Child,
    cfg: &Config,
    stream_log: &mut StreamLog,
) {
    let silence = ctx.last_heartbeat.elapsed();

    if silence > cfg.silence_warning && !ctx.silence_warned {
        ctx.silence_warned = true;
        ctx.silence_warnings += 1;
        deps.stats.record_silence_warning();
        let silence_ms = silence.as_millis() as u64;
        warn!(request_id = %ctx.request_id, silence_ms, "agent is silent");
        stream_log
            .warn(&format!("no output for {silence_ms}ms"))
            .await;
        deps.events.emit(CoordinatorEvent::SilenceWarning {
            request_id: ctx.request_id.clone(),
            silence_ms,
        });
    }

    if silence > cfg.heartbeat_timeout && !ctx.showing_progress(cfg) {
        terminate(deps, ctx, child, FailureReason::HeartbeatTimeout, stream_log).await;
    }
}

async fn progress_tick(ctx: &AgentContext, cfg: &Config, stream_log: &mut StreamLog) {
    let elapsed = ctx.started.elapsed();
    let remaining = ctx.deadline.saturating_sub(elapsed);
    let silence = ctx.last_heartbeat.elapsed();

    debug!(
        request_id = %ctx.request_id,
        elapsed_ms = elapsed.as_millis() as u64,
        remaining_ms = remaining.as_millis() as u64,
        bursts = ctx.output_bursts,
        bytes = ctx.total_output_bytes,
        "progress"
    );

    if silence > cfg.progress_silence_warn && remaining < cfg.near_deadline_warn {
        warn!(
            request_id = %ctx.request_id,
            silence_ms = silence.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            "agent silent with deadline approaching"
        );
        stream_log
            .warn(&format!(
                "silent for {}ms with {}ms of deadline left",
                silence.as_millis(),
                remaining.as_millis()
            ))
            .await;
    }
}

/// Send the cooperative terminate signal once. The close event still owns
/// finalization; between here and the close the slot stays in-flight.
async fn terminate(
    deps: &SupervisorDeps,
    ctx: &mut AgentContext,
    child: &mut Child,
    reason: FailureReason,
    stream_log: &mut StreamLog,
) {
    if ctx.terminated {
        return;
    }
    ctx.terminated = true;
    ctx.kill_reason = Some(reason);

    if reason == FailureReason::HeartbeatTimeout {
        deps.stats.record_heartbeat_timeout();
    }

    warn!(
        request_id = %ctx.request_id,
        reason = %reason,
        elapsed_ms = ctx.elapsed_ms(),
        "terminating agent"
    );
    stream_log
        .warn(&format!("terminating agent: {reason}"))
        .await;
    deps.events.emit(CoordinatorEvent::AgentKilled {
        request_id: ctx.request_id.clone(),
        reason,
    });

    if let Some(pid) = child.id() {
        // SIGTERM, never SIGKILL: the child close event releases the slot
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

async fn write_result(deps: &SupervisorDeps, record: &ResultRecord) {
    let path = deps.dirs.result_path(&record.request_id);
    let body = match serde_json::to_string_pretty(record) {
        Ok(body) => body,
        Err(e) => {
            error!(request_id = %record.request_id, error = %e, "result serialization failed");
            return;
        }
    };
    if let Err(e) = tokio::fs::write(&path, body).await {
        // degrade observability, never abort running agents
        error!(request_id = %record.request_id, error = %e, "result write failed");
        eprintln!(
            "swarmd: failed to write result for {}: {e}",
            record.request_id
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn failure_record(
    req: &Request,
    request_id: &str,
    classification: &Classification,
    probe_outcome: &probe::ProbeOutcome,
    plan: &PromptPlan,
    output: String,
    duration_ms: u64,
    exit_code: i32,
    failure_reason: Option<FailureReason>,
) -> ResultRecord {
    ResultRecord {
        request_id: request_id.to_string(),
        status: RunStatus::Failed,
        output,
        duration_ms,
        exit_code,
        failure_reason,
        agent_role: req.role().to_string(),
        parent_request_id: req.parent_request_id.clone(),
        completed_at: chrono::Utc::now().to_rfc3339(),
        stats: RunStats {
            health_check_ms: Some(probe_outcome.duration.as_millis() as u64),
            startup_latency_ms: None,
            complexity: classification.class,
            complexity_score: classification.score,
            extensions_applied: 0,
            output_bursts: 0,
            total_output_bytes: 0,
            used_lazy_context: plan.used_lazy,
            context_loaded_from_file: false,
            silence_warnings: 0,
        },
    }
}
