//! End-to-end tests: the full coordinator driving real child processes.
//!
//! Children are `/bin/sh` stub scripts written into a temp directory. Every
//! test gets its own spool root and compressed timescales, so the suite runs
//! in seconds while exercising the same code paths as production: intake,
//! claim, admission, probe, supervision, result writing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use swarmd::config::Config;
use swarmd::coordinator::Coordinator;
use swarmd::events::CoordinatorEvent;
use swarmd::spool::SpoolDirs;
use swarmd::types::FailureReason;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("stub.sh");
    std::fs::write(&path, body).unwrap();
    path
}

/// Base test config: fast polling, fast restores, stub child.
fn base_config(root: &Path, script: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.swarm_dir = root.join("spool");
    cfg.agent_cmd = "/bin/sh".to_string();
    cfg.agent_args = vec![script.to_string_lossy().to_string()];
    cfg.poll_interval = Duration::from_millis(50);
    cfg.restore_delay = Duration::from_millis(100);
    cfg.health_check_timeout = Duration::from_secs(5);
    cfg.shutdown_grace = Duration::from_secs(3);
    cfg
}

fn dirs_of(cfg: &Config) -> SpoolDirs {
    SpoolDirs::new(&cfg.swarm_dir)
}

async fn drop_request(dirs: &SpoolDirs, name: &str, body: &str) {
    tokio::fs::write(dirs.requests.join(name), body)
        .await
        .unwrap();
}

async fn wait_for_results(
    dirs: &SpoolDirs,
    count: usize,
    timeout: Duration,
) -> Vec<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut found = Vec::new();
        if let Ok(rd) = std::fs::read_dir(&dirs.results) {
            for entry in rd.flatten() {
                if entry.path().extension().is_some_and(|x| x == "json") {
                    if let Ok(raw) = std::fs::read_to_string(entry.path()) {
                        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&raw) {
                            found.push(v);
                        }
                    }
                }
            }
        }
        if found.len() >= count {
            return found;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("expected {count} result(s), found {}", found.len());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn happy_path_writes_a_success_record() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho READY\necho hello\nexit 0\n");
    let cfg = base_config(tmp.path(), &script);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(
        &dirs,
        "job.json",
        r#"{"agentRole":"w","task":{"objective":"echo hello"}}"#,
    )
    .await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "success");
    assert_eq!(r["exitCode"], 0);
    assert!(r["output"].as_str().unwrap().contains("hello"));
    assert_eq!(r["agentRole"], "w");
    assert!(r.get("failureReason").is_none());
    assert!(r["stats"]["healthCheckMs"].as_u64().unwrap() >= 1);
    assert_eq!(r["stats"]["extensionsApplied"], 0);
    assert!(r["stats"]["outputBursts"].as_u64().unwrap() >= 1);

    // the inbox and claim area are both drained
    assert_eq!(std::fs::read_dir(&dirs.requests).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(&dirs.processing).unwrap().count(), 0);

    coordinator.shutdown().await;
}

// ===========================================================================
// Health probe
// ===========================================================================

#[tokio::test]
async fn dead_on_arrival_child_fails_the_probe() {
    let tmp = tempfile::tempdir().unwrap();
    // never writes a byte
    let script = write_script(tmp.path(), "cat >/dev/null\nexec sleep 30\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.health_check_timeout = Duration::from_millis(200);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "job.json", r#"{"task":{"objective":"anything"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "failed");
    assert_eq!(r["failureReason"], "HEALTH_CHECK_FAILED");
    assert_eq!(r["output"], "timeout");
    // the task child was never spawned, so no output was ever recorded
    assert_eq!(r["stats"]["outputBursts"], 0);
    assert_eq!(coordinator.stats().health_checks_failed, 1);
    // the request was consumed, not requeued
    assert_eq!(std::fs::read_dir(&dirs.requests).unwrap().count(), 0);

    coordinator.shutdown().await;
}

// ===========================================================================
// Progressive timeout and extensions
// ===========================================================================

#[tokio::test]
async fn steady_producer_earns_deadline_extensions() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(
        tmp.path(),
        "cat >/dev/null\ni=0\nwhile [ $i -lt 20 ]; do echo tick $i; i=$((i+1)); sleep 0.1; done\nexit 0\n",
    );
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    cfg.initial_timeout = Duration::from_millis(1000);
    cfg.max_timeout = Duration::from_millis(4000);
    cfg.timeout_extension = Duration::from_millis(1000);
    cfg.extension_proximity = Duration::from_millis(1500);
    cfg.activity_window = Duration::from_millis(1000);
    cfg.min_output_bursts = 2;
    cfg.heartbeat_check_interval = Duration::from_millis(200);
    cfg.heartbeat_timeout = Duration::from_secs(10);
    cfg.silence_warning = Duration::from_secs(5);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "job.json", r#"{"task":{"objective":"emit ticks"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(15)).await;
    let r = &results[0];
    assert_eq!(r["status"], "success", "record: {r}");
    assert!(
        r["stats"]["extensionsApplied"].as_u64().unwrap() >= 1,
        "expected at least one extension, record: {r}"
    );
    assert!(coordinator.stats().timeout_extensions >= 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn stalled_child_hits_the_progressive_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    // one greeting, then nothing: no progress, no extension
    let script = write_script(tmp.path(), "cat >/dev/null\necho starting\nexec sleep 60\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    cfg.initial_timeout = Duration::from_millis(600);
    cfg.max_timeout = Duration::from_millis(2000);
    cfg.timeout_extension = Duration::from_millis(500);
    // keep the heartbeat killer out of this scenario
    cfg.heartbeat_check_interval = Duration::from_secs(30);
    cfg.heartbeat_timeout = Duration::from_secs(60);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "job.json", r#"{"task":{"objective":"idle"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "failed");
    assert_eq!(r["failureReason"], "PROGRESSIVE_TIMEOUT");
    assert_eq!(r["stats"]["extensionsApplied"], 0);
    assert_eq!(coordinator.stats().early_timeouts, 1);

    coordinator.shutdown().await;
}

// ===========================================================================
// Heartbeat / silence detection
// ===========================================================================

#[tokio::test]
async fn silent_child_is_killed_by_the_heartbeat() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho hello\nexec sleep 60\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    cfg.initial_timeout = Duration::from_secs(30);
    cfg.max_timeout = Duration::from_secs(60);
    cfg.heartbeat_check_interval = Duration::from_millis(100);
    cfg.silence_warning = Duration::from_millis(300);
    cfg.heartbeat_timeout = Duration::from_millis(700);
    cfg.activity_window = Duration::from_millis(300);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    let mut events = coordinator.events();
    drop_request(&dirs, "job.json", r#"{"task":{"objective":"idle"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "failed");
    assert_eq!(r["failureReason"], "HEARTBEAT_TIMEOUT");
    // the soft warning fired before the kill
    assert!(r["stats"]["silenceWarnings"].as_u64().unwrap() >= 1);
    assert_eq!(coordinator.stats().heartbeat_timeouts, 1);
    assert!(coordinator.stats().silence_warnings >= 1);

    // observers saw the warning and the kill, in that order
    let mut saw_warning = false;
    let mut saw_kill = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoordinatorEvent::SilenceWarning { .. } => saw_warning = true,
            CoordinatorEvent::AgentKilled { reason, .. } => {
                assert!(saw_warning, "kill arrived before the silence warning");
                assert_eq!(reason, FailureReason::HeartbeatTimeout);
                saw_kill = true;
            }
            _ => {}
        }
    }
    assert!(saw_warning && saw_kill);

    coordinator.shutdown().await;
}

// ===========================================================================
// Admission throttling
// ===========================================================================

#[tokio::test]
async fn concurrency_never_exceeds_the_ceiling() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(
        tmp.path(),
        "cat >/dev/null\necho READY\nsleep 0.4\nexit 0\n",
    );
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    cfg.max_concurrent_agents = 2;
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    for i in 0..5 {
        drop_request(
            &dirs,
            &format!("job-{i}.json"),
            &format!(r#"{{"requestId":"req-throttle-{i}","task":{{"objective":"idle"}}}}"#),
        )
        .await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        assert!(
            coordinator.active_agents() <= 2,
            "ceiling exceeded: {}",
            coordinator.active_agents()
        );
        let done = std::fs::read_dir(&dirs.results)
            .map(|rd| rd.count())
            .unwrap_or(0);
        if done >= 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {done} of 5 results arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let results = wait_for_results(&dirs, 5, Duration::from_secs(5)).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r["status"] == "success"));

    coordinator.shutdown().await;
}

// ===========================================================================
// Intake idempotence and corruption
// ===========================================================================

#[tokio::test]
async fn duplicate_request_ids_spawn_once() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho READY\nexit 0\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    let body = r#"{"requestId":"req-dup-1","task":{"objective":"once"}}"#;
    drop_request(&dirs, "a.json", body).await;
    drop_request(&dirs, "b.json", body).await;

    wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    // give the duplicate every chance to (incorrectly) produce a second run
    tokio::time::sleep(Duration::from_secs(1)).await;

    let count = std::fs::read_dir(&dirs.results).unwrap().count();
    assert_eq!(count, 1);
    let snap = coordinator.stats();
    assert_eq!(snap.completed + snap.failed, 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn malformed_request_is_deleted_without_a_result() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho READY\nexit 0\n");
    let cfg = base_config(tmp.path(), &script);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "bad.json", "this is { not json").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while dirs.requests.join("bad.json").exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "malformed file was never deleted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(std::fs::read_dir(&dirs.results).unwrap().count(), 0);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn missing_request_id_gets_a_synthesized_one() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho READY\nexit 0\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "anon.json", r#"{"task":{"objective":"anon"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let id = results[0]["requestId"].as_str().unwrap();

    // ^req-\d+-[a-z0-9]{6}$
    let mut parts = id.splitn(3, '-');
    assert_eq!(parts.next(), Some("req"));
    let millis = parts.next().unwrap();
    assert!(!millis.is_empty() && millis.chars().all(|c| c.is_ascii_digit()));
    let suffix = parts.next().unwrap();
    assert_eq!(suffix.len(), 6);
    assert!(suffix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

    coordinator.shutdown().await;
}

// ===========================================================================
// Boundary behaviors
// ===========================================================================

#[tokio::test]
async fn silent_clean_exit_is_still_a_success() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\nexit 0\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "quiet.json", r#"{"task":{"objective":"nothing"}}"#).await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "success");
    assert_eq!(r["exitCode"], 0);
    assert_eq!(r["stats"]["outputBursts"], 0);
    assert!(r["stats"]["startupLatencyMs"].is_null());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn oversized_context_is_spilled_and_advertised() {
    let tmp = tempfile::tempdir().unwrap();
    // the child echoes its context-file path, which sets the loaded flag
    let script = write_script(
        tmp.path(),
        "cat >/dev/null\necho READY\necho \"loading $SWARM_CONTEXT_FILE\"\nexit 0\n",
    );
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    let blob = "x".repeat(800);
    drop_request(
        &dirs,
        "big.json",
        &format!(
            r#"{{"requestId":"req-big-1","task":{{"objective":"summarize","context":{{"blob":"{blob}"}}}}}}"#
        ),
    )
    .await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(10)).await;
    let r = &results[0];
    assert_eq!(r["status"], "success");
    assert_eq!(r["stats"]["usedLazyContext"], true);
    assert_eq!(r["stats"]["contextLoadedFromFile"], true);
    assert!(dirs.context.join("req-big-1.json").exists());
    assert_eq!(coordinator.stats().lazy_context_used, 1);

    coordinator.shutdown().await;
}

// ===========================================================================
// Shutdown
// ===========================================================================

#[tokio::test]
async fn shutdown_terminates_live_agents_with_reason() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "cat >/dev/null\necho working\nexec sleep 60\n");
    let mut cfg = base_config(tmp.path(), &script);
    cfg.skip_health_check = true;
    cfg.initial_timeout = Duration::from_secs(60);
    cfg.heartbeat_check_interval = Duration::from_secs(30);
    cfg.heartbeat_timeout = Duration::from_secs(120);
    let dirs = dirs_of(&cfg);

    let coordinator = Coordinator::start(cfg).await.unwrap();
    drop_request(&dirs, "job.json", r#"{"task":{"objective":"run forever"}}"#).await;

    // wait until the agent is actually live
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while coordinator.active_agents() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "agent never started");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    coordinator.shutdown().await;

    let results = wait_for_results(&dirs, 1, Duration::from_secs(5)).await;
    let r = &results[0];
    assert_eq!(r["status"], "failed");
    assert_eq!(r["failureReason"], "SHUTDOWN");
}
