//! Agent runner: launches the agent subprocess, streams its output
//! non-blocking, and writes one structured event per observable occurrence
//! to the append-only work-stream log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bosun_core::types::{WorkStreamEvent, WorkStreamEventType};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("work-stream log write failed: {0}")]
    Log(String),
    #[error("agent run timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub task_id: String,
    pub executor: String,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub has_commits: bool,
    pub raw_error: Option<String>,
    pub combined_output: String,
}

/// Appends one JSON line per work-stream event. Mirrors the append-only,
/// single-writer-per-line contract the analyzer relies on for tailing.
pub struct WorkStreamWriter {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl WorkStreamWriter {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(RunnerError::Spawn)?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: tokio::sync::Mutex::new(file) })
    }

    pub async fn append(&self, event: &WorkStreamEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).map_err(|e| RunnerError::Log(e.to_string()))?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Runs the agent subprocess, emitting work-stream events as it goes.
/// Cancellation-safe: dropping the returned future (or a cancel signal)
/// still allows the caller to observe a `session_end` with
/// `completion_status = cancelled` because that event is written before
/// the process is torn down, not after.
pub async fn run(
    req: RunRequest,
    log: &WorkStreamWriter,
    mut cancel: mpsc::Receiver<()>,
) -> Result<RunOutcome> {
    let attempt_id = Uuid::new_v4();

    log.append(&WorkStreamEvent {
        attempt_id,
        event_type: WorkStreamEventType::SessionStart,
        timestamp: chrono::Utc::now(),
        task_id: Some(req.task_id.clone()),
        executor: Some(req.executor.clone()),
        data: serde_json::json!({ "prompt_type": "initial" }),
    })
    .await?;

    let mut child = Command::new(&req.command)
        .args(&req.args)
        .current_dir(&req.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(req.prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut combined_output = String::new();
    let mut cancelled = false;
    let mut heartbeat = tokio::time::interval(req.heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately; consume it

    let deadline = tokio::time::sleep(req.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(l)) => { combined_output.push_str(&l); combined_output.push('\n'); }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            line = stderr_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        combined_output.push_str(&l);
                        combined_output.push('\n');
                        log.append(&WorkStreamEvent {
                            attempt_id,
                            event_type: WorkStreamEventType::Error,
                            timestamp: chrono::Utc::now(),
                            task_id: Some(req.task_id.clone()),
                            executor: Some(req.executor.clone()),
                            data: serde_json::json!({ "error_fingerprint": fingerprint(&l), "error_message": l }),
                        }).await?;
                    }
                    Ok(None) => {}
                    Err(_) => {}
                }
            }
            _ = heartbeat.tick() => {
                log.append(&WorkStreamEvent {
                    attempt_id,
                    event_type: WorkStreamEventType::Heartbeat,
                    timestamp: chrono::Utc::now(),
                    task_id: Some(req.task_id.clone()),
                    executor: Some(req.executor.clone()),
                    data: serde_json::json!({}),
                }).await?;
            }
            _ = &mut deadline => {
                let _ = child.start_kill();
                break;
            }
            _ = cancel.recv() => {
                cancelled = true;
                let _ = child.start_kill();
                break;
            }
        }
    }

    let status = child.wait().await.ok();
    let success = !cancelled && status.map(|s| s.success()).unwrap_or(false);
    let has_commits = combined_output.contains("git commit") || combined_output.contains("[main");

    let completion_status = if cancelled { "cancelled" } else if success { "success" } else { "failed" };

    log.append(&WorkStreamEvent {
        attempt_id,
        event_type: WorkStreamEventType::SessionEnd,
        timestamp: chrono::Utc::now(),
        task_id: Some(req.task_id.clone()),
        executor: Some(req.executor.clone()),
        data: serde_json::json!({ "completion_status": completion_status }),
    })
    .await?;

    Ok(RunOutcome {
        success,
        has_commits,
        raw_error: if success { None } else { Some(combined_output.clone()) },
        combined_output,
    })
}

fn fingerprint(line: &str) -> String {
    let truncated: String = line.chars().take(80).collect();
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn work_stream_writer_appends_valid_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work-stream.jsonl");
        let writer = WorkStreamWriter::open(&path).await.unwrap();

        let event = WorkStreamEvent {
            attempt_id: Uuid::new_v4(),
            event_type: WorkStreamEventType::SessionStart,
            timestamp: chrono::Utc::now(),
            task_id: Some("T1".into()),
            executor: Some("claude".into()),
            data: serde_json::json!({}),
        };
        writer.append(&event).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(serde_json::from_str::<serde_json::Value>(content.lines().next().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn run_executes_command_and_detects_commit_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ws.jsonl");
        let writer = WorkStreamWriter::open(&log_path).await.unwrap();
        let (_tx, rx) = mpsc::channel(1);

        let req = RunRequest {
            prompt: "do the task".into(),
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            task_id: "T1".into(),
            executor: "echo".into(),
            command: "echo".into(),
            args: vec!["git commit -m done".into()],
        };

        let outcome = run(req, &writer, rx).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.has_commits);

        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(content.contains("session_start"));
        assert!(content.contains("session_end"));
    }

    #[tokio::test]
    async fn run_reports_cancelled_completion_status() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ws.jsonl");
        let writer = WorkStreamWriter::open(&log_path).await.unwrap();
        let (tx, rx) = mpsc::channel(1);

        let req = RunRequest {
            prompt: "do the task".into(),
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            task_id: "T1".into(),
            executor: "sleep".into(),
            command: "sleep".into(),
            args: vec!["5".into()],
        };

        tx.send(()).await.unwrap();
        let outcome = run(req, &writer, rx).await.unwrap();
        assert!(!outcome.success);

        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(content.contains("cancelled"));
    }
}
