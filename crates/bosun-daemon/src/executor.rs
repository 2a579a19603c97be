//! Seam between the scheduler and the agent runner, so the scheduler's
//! pipeline tests can swap in a scripted executor instead of spawning a
//! real subprocess.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bosun_agents::runner::{self, RunRequest, WorkStreamWriter};

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub has_commits: bool,
    pub raw_error: Option<String>,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, task_id: &str, worktree_path: &str, prompt: &str) -> AgentOutcome;
}

/// Drives the real agent subprocess via `bosun_agents::runner`, writing to a
/// shared per-workspace work-stream log the analyzer tails.
pub struct SubprocessExecutor {
    work_stream: WorkStreamWriter,
    command: String,
    executor_name: String,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl SubprocessExecutor {
    pub async fn new(
        work_stream_path: impl Into<PathBuf>,
        command: impl Into<String>,
        executor_name: impl Into<String>,
        timeout: Duration,
        heartbeat_interval: Duration,
    ) -> std::io::Result<Self> {
        let work_stream = WorkStreamWriter::open(work_stream_path)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self { work_stream, command: command.into(), executor_name: executor_name.into(), timeout, heartbeat_interval })
    }
}

#[async_trait]
impl AgentExecutor for SubprocessExecutor {
    async fn run(&self, task_id: &str, worktree_path: &str, prompt: &str) -> AgentOutcome {
        let (_cancel_tx, cancel_rx) = tokio::sync::mpsc::channel(1);
        let req = RunRequest {
            prompt: prompt.to_string(),
            cwd: PathBuf::from(worktree_path),
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
            task_id: task_id.to_string(),
            executor: self.executor_name.clone(),
            command: self.command.clone(),
            args: Vec::new(),
        };

        match runner::run(req, &self.work_stream, cancel_rx).await {
            Ok(outcome) => AgentOutcome { success: outcome.success, has_commits: outcome.has_commits, raw_error: outcome.raw_error },
            Err(e) => AgentOutcome { success: false, has_commits: false, raw_error: Some(e.to_string()) },
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedExecutor {
        pub outcomes: Mutex<std::collections::VecDeque<AgentOutcome>>,
    }

    impl ScriptedExecutor {
        pub fn new(outcomes: Vec<AgentOutcome>) -> Self {
            Self { outcomes: Mutex::new(outcomes.into()) }
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn run(&self, _task_id: &str, _worktree_path: &str, _prompt: &str) -> AgentOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AgentOutcome { success: false, has_commits: false, raw_error: Some("no scripted outcome".into()) })
        }
    }
}
