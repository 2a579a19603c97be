//! `bosun`: small operator-facing CLI over the daemon's persisted state.
//! Does not talk to the running daemon process directly — it reads the
//! same sqlite store and lockfile the daemon owns.

use anyhow::{Context, Result};
use bosun_core::config::Config;
use bosun_core::lockfile::DaemonLockfile;
use bosun_core::persistence::Db;
use bosun_core::types::TaskStatus;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bosun", about = "Operator CLI for the bosun task orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether the daemon is running and summarize task counts.
    Status,
    /// Check config, persistence, and lockfile health.
    Doctor,
    /// List currently held task claims.
    Claims,
}

#[tokio::main]
async fn main() -> Result<()> {
    bosun_telemetry::logging::init_logging("bosun-cli", "warn");
    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Command::Status => status(&config).await,
        Command::Doctor => doctor(&config).await,
        Command::Claims => claims(&config).await,
    }
}

async fn open_db(config: &Config) -> Result<Db> {
    let state_root = shellexpand_home(&config.persistence.state_root);
    Db::open(state_root.join("bosun.sqlite3")).await.context("opening persistence db")
}

async fn status(config: &Config) -> Result<()> {
    match DaemonLockfile::read_valid() {
        Some(lock) => println!("daemon: running (pid={})", lock.pid),
        None => println!("daemon: not running"),
    }

    let db = open_db(config).await?;
    for status in [
        TaskStatus::Backlog,
        TaskStatus::Todo,
        TaskStatus::Inprogress,
        TaskStatus::Inreview,
        TaskStatus::Blocked,
    ] {
        let count = db.tasks_by_status(status).await?.len();
        println!("{status}: {count}");
    }
    Ok(())
}

async fn doctor(config: &Config) -> Result<()> {
    let mut ok = true;

    match open_db(config).await {
        Ok(_) => println!("[ok] persistence store opens cleanly"),
        Err(e) => {
            println!("[fail] persistence store: {e}");
            ok = false;
        }
    }

    match config.kanban.backend.as_str() {
        "github" => {
            if config.kanban.github_owner.is_none() || config.kanban.github_repo.is_none() {
                println!("[fail] kanban backend is 'github' but github_owner/github_repo are not set");
                ok = false;
            } else if std::env::var("GITHUB_TOKEN").is_err() {
                println!("[fail] GITHUB_TOKEN is not set");
                ok = false;
            } else {
                println!("[ok] github kanban backend configured");
            }
        }
        "local" => println!("[ok] local kanban backend configured"),
        other => {
            println!("[fail] unknown kanban backend: {other}");
            ok = false;
        }
    }

    match DaemonLockfile::read_valid() {
        Some(lock) => println!("[ok] daemon running (pid={})", lock.pid),
        None => println!("[info] daemon not running"),
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn claims(config: &Config) -> Result<()> {
    let db = open_db(config).await?;
    let claims = db.claims_all().await?;
    if claims.is_empty() {
        println!("no active claims");
        return Ok(());
    }
    for claim in claims {
        println!(
            "{}  holder={}  acquired_at={}  ttl_minutes={}",
            claim.task_id, claim.holder_id, claim.acquired_at, claim.ttl_minutes
        );
    }
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
