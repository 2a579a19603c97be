//! Bosun daemon: polls the configured kanban backend for `todo` tasks and
//! runs each through the scheduler's pipeline with bounded parallelism.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bosun_core::config::Config;
use bosun_core::event_bus::EventBus;
use bosun_core::git_runner::RealGitRunner;
use bosun_core::lockfile::DaemonLockfile;
use bosun_core::persistence::Db;
use bosun_core::types::TaskStatus;
use bosun_core::worktree_manager::WorktreeManager;
use bosun_daemon::executor::SubprocessExecutor;
use bosun_daemon::Scheduler;
use bosun_kanban::adapter::KanbanAdapter;
use bosun_kanban::github::GitHubAdapter;
use bosun_kanban::local::LocalAdapter;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    bosun_telemetry::logging::init_logging("bosund", "info");

    let config = Config::load();
    info!(max_parallel = config.scheduler.max_parallel, "bosund starting");

    let replace_mode = std::env::args().any(|a| a == "--replace" || a == "-r");
    if let Some(existing) = DaemonLockfile::read_valid() {
        if replace_mode {
            info!(pid = existing.pid, "replacing existing daemon (--replace)");
            #[cfg(unix)]
            unsafe {
                libc::kill(existing.pid as i32, libc::SIGTERM);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            DaemonLockfile::remove();
        } else {
            eprintln!("bosund already running (pid={}). Use --replace to restart it.", existing.pid);
            std::process::exit(1);
        }
    }

    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        started_at: chrono::Utc::now().to_rfc3339(),
        workspace_root: std::env::current_dir().ok().map(|p| p.to_string_lossy().into_owned()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(msg) = lockfile.acquire_or_fail() {
        eprintln!("failed to acquire lockfile: {msg}");
        std::process::exit(1);
    }

    let state_root = shellexpand_home(&config.persistence.state_root);
    let db = Db::open(state_root.join("bosun.sqlite3")).await.context("opening persistence db")?;

    let kanban: Arc<dyn KanbanAdapter> = match config.kanban.backend.as_str() {
        "github" => {
            let owner = config.kanban.github_owner.clone().context("kanban.github_owner required for github backend")?;
            let repo = config.kanban.github_repo.clone().context("kanban.github_repo required for github backend")?;
            let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN required for github backend")?;
            Arc::new(GitHubAdapter::new(token, owner, repo, db).context("building github adapter")?)
        }
        _ => Arc::new(LocalAdapter::new(db)),
    };

    let repo_root = config.scheduler.repo_root.clone().unwrap_or_else(|| ".".to_string());
    let worktrees = Arc::new(WorktreeManager::new(repo_root, Box::new(RealGitRunner)));
    let git = Arc::new(RealGitRunner);
    let event_bus = Arc::new(EventBus::new());

    let cache_root = shellexpand_home(&config.persistence.cache_root);
    let work_logs_dir = cache_root.join("agent-work-logs");
    let work_stream_path = work_logs_dir.join("agent-work-stream.jsonl");
    let alerts_path = work_logs_dir.join("agent-alerts.jsonl");

    let executor = Arc::new(
        SubprocessExecutor::new(
            work_stream_path.clone(),
            std::env::var("BOSUN_AGENT_COMMAND").unwrap_or_else(|_| "claude".to_string()),
            "claude",
            Duration::from_millis(config.scheduler.task_timeout_ms),
            Duration::from_millis(config.analyzer.heartbeat_interval_ms),
        )
        .await
        .context("opening work-stream log")?,
    );

    let scheduler = Arc::new(Scheduler::new(
        Uuid::new_v4(),
        kanban.clone(),
        worktrees,
        git,
        executor,
        event_bus.clone(),
        config.scheduler.max_parallel,
        config.scheduler.base_branch_limit,
        config.claim.ttl_minutes,
        config.claim.renew_interval_ms,
        Duration::from_millis(config.scheduler.task_timeout_ms),
    ));

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            DaemonLockfile::remove();
            shutdown_signal.notify_waiters();
        }
    });

    let mut analyzer = bosun_analyzer::analyzer::Analyzer::open(&work_stream_path, &alerts_path, event_bus.clone(), config.analyzer.clone())
        .context("opening work-stream analyzer")?;
    let analyzer_shutdown = shutdown.clone();
    let analyzer_tick = Duration::from_millis(config.analyzer.stuck_sweep_interval_ms.min(5_000));
    tokio::spawn(async move {
        loop {
            if let Err(e) = analyzer.drain_available().await {
                tracing::warn!(error = %e, "analyzer drain failed");
            }
            if let Err(e) = analyzer.sweep() {
                tracing::warn!(error = %e, "analyzer sweep failed");
            }
            tokio::select! {
                _ = analyzer_shutdown.notified() => break,
                _ = tokio::time::sleep(analyzer_tick) => {}
            }
        }
    });

    info!("bosund ready, entering poll loop");
    let poll_interval = Duration::from_millis(config.scheduler.poll_interval_ms);
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        if scheduler.should_pause() {
            tracing::warn!("executor paused: rate-limit hit threshold exceeded globally, skipping admission this tick");
            continue;
        }

        let mut todo = match kanban.list(TaskStatus::Todo).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list todo tasks");
                continue;
            }
        };

        sort_by_priority(&mut todo);

        for task in todo {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let outcome = scheduler.run_task(task).await;
                tracing::debug!(?outcome, "task pipeline finished");
            });
        }
    }

    DaemonLockfile::remove();
    info!("bosund stopped");
    Ok(())
}

fn shellexpand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

/// Deterministic admission order: explicit priority desc, then updatedAt
/// desc, then task id lex, so every bosund instance pulling from the same
/// backend agrees on who goes first.
fn sort_by_priority(tasks: &mut [bosun_core::types::Task]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
}
