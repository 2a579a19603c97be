//! Task lifecycle scheduler: drives each task through
//! `todo -> inprogress -> {inreview | todo (cooldown) | blocked}` with
//! bounded parallelism and guaranteed resource cleanup on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bosun_agents::classifier;
use bosun_agents::recovery::{Action, RecoveryPolicy};
use bosun_core::event_bus::EventBus;
use bosun_core::git_runner::GitRunner;
use bosun_core::types::{Task, TaskStatus};
use bosun_core::worktree_manager::WorktreeManager;
use bosun_kanban::adapter::KanbanAdapter;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::executor::AgentExecutor;
use crate::slots::SlotManager;
use crate::task_error::{ErrorKind, TaskError};

pub const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop", "production"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    InReview,
    NoOpCooldown,
    PushFailedTodo,
    Blocked,
    AlreadyClaimed,
    NoSlot,
}

pub struct Scheduler {
    pub holder_id: Uuid,
    kanban: Arc<dyn KanbanAdapter>,
    worktrees: Arc<WorktreeManager>,
    git: Arc<dyn GitRunner>,
    executor: Arc<dyn AgentExecutor>,
    event_bus: Arc<EventBus>,
    slots: SlotManager,
    claim_ttl_minutes: i64,
    renew_interval_ms: u64,
    task_timeout: Duration,
    recovery: Mutex<RecoveryPolicy>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    guidance_prompts: Mutex<HashMap<String, String>>,
}

const NOOP_COOLDOWN_SECS: i64 = 300;

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        holder_id: Uuid,
        kanban: Arc<dyn KanbanAdapter>,
        worktrees: Arc<WorktreeManager>,
        git: Arc<dyn GitRunner>,
        executor: Arc<dyn AgentExecutor>,
        event_bus: Arc<EventBus>,
        max_parallel: u32,
        base_branch_limit: u32,
        claim_ttl_minutes: i64,
        renew_interval_ms: u64,
        task_timeout: Duration,
    ) -> Self {
        Self {
            holder_id,
            kanban,
            worktrees,
            git,
            executor,
            event_bus,
            slots: SlotManager::new(max_parallel, base_branch_limit),
            claim_ttl_minutes,
            renew_interval_ms,
            task_timeout,
            recovery: Mutex::new(RecoveryPolicy::new()),
            cooldowns: Mutex::new(HashMap::new()),
            guidance_prompts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the global rate-limit hit list exceeds the pause threshold.
    /// The caller (the daemon's poll loop) should stop admitting new tasks
    /// while this is true and emit `executor-paused`.
    pub fn should_pause(&self) -> bool {
        self.recovery.lock().unwrap().should_pause_executor()
    }

    fn in_cooldown(&self, task_id: &str) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap();
        cooldowns
            .get(task_id)
            .map(|until| Utc::now() < *until)
            .unwrap_or(false)
    }

    fn set_cooldown(&self, task_id: &str) {
        self.cooldowns.lock().unwrap().insert(task_id.to_string(), Utc::now() + chrono::Duration::seconds(NOOP_COOLDOWN_SECS));
    }

    /// Runs the full per-task pipeline. Cleanup (worktree -> claim -> slot)
    /// always runs, on every exit path including the classifier-driven
    /// early returns.
    pub async fn run_task(&self, task: Task) -> TaskOutcome {
        if self.in_cooldown(&task.task_id) {
            return TaskOutcome::NoOpCooldown;
        }

        let base_branch = task.base_branch.clone().unwrap_or_else(|| "origin/main".to_string());
        let branch = task.branch_name.clone().unwrap_or_else(|| format!("bosun/{}", task.task_id));

        let Some(mut slot) = self.slots.try_acquire(&base_branch) else {
            return TaskOutcome::NoSlot;
        };

        let claim_outcome = match self.kanban.claim(&task.task_id, self.holder_id, self.claim_ttl_minutes).await {
            Ok(outcome) => outcome,
            Err(_) => {
                slot.release();
                return TaskOutcome::AlreadyClaimed;
            }
        };
        if !claim_outcome.ok {
            self.event_bus.emit("task.claim_conflict", Some(task.task_id.clone()), serde_json::json!({}));
            slot.release();
            return TaskOutcome::AlreadyClaimed;
        }

        let renewer = self.spawn_renewer(task.task_id.clone());

        let (outcome, worktree_path, pr_opened) = self.run_claimed(&task, &branch, &base_branch).await;

        // Cleanup runs unconditionally: worktree -> claim (stop renewer) -> slot.
        if let Some(path) = worktree_path {
            let _ = self.worktrees.release(&path, pr_opened);
        }
        renewer.abort();
        let _ = self.kanban.release(&task.task_id, self.holder_id).await;
        slot.release();

        outcome
    }

    /// Starts the background auto-renew timer for a held claim (§4.1 step 3):
    /// ticks every `renewIntervalMs` and re-writes the lease so it doesn't
    /// lapse mid-run on tasks that outlive `ttlMinutes`. Aborted by the
    /// caller once the claim is released.
    fn spawn_renewer(&self, task_id: String) -> tokio::task::JoinHandle<()> {
        let kanban = self.kanban.clone();
        let holder_id = self.holder_id;
        let interval = Duration::from_millis(self.renew_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match kanban.renew(&task_id, holder_id).await {
                    Ok(outcome) if outcome.ok => {}
                    _ => break, // lease stolen or renewal failed; stop trying
                }
            }
        })
    }

    /// Returns the outcome alongside the worktree path (if one was
    /// acquired) and whether a PR was opened on this branch, so the
    /// caller's cleanup can release the worktree (and prune the local
    /// branch when no PR claims it) on every exit path.
    async fn run_claimed(&self, task: &Task, branch: &str, base_branch: &str) -> (TaskOutcome, Option<String>, bool) {
        if self.kanban.set_status(&task.task_id, TaskStatus::Inprogress, "scheduler").await.is_err() {
            return (TaskOutcome::Blocked, None, false);
        }
        self.event_bus.emit("task.started", Some(task.task_id.clone()), serde_json::json!({}));

        let acquired = match self.worktrees.acquire(branch, &task.task_id, base_branch) {
            Ok(a) => a,
            Err(e) => {
                let outcome = self.handle_error(task, TaskError::worktree_unavailable(e.to_string())).await;
                return (outcome, None, false);
            }
        };
        let worktree_path = acquired.worktree_path.clone();

        let pre_head = self.git.run_git(&acquired.worktree_path, &["rev-parse", "HEAD"]).ok().map(|o| o.stdout.trim().to_string());

        let mut prompt = format!("Task {}: {}\n\n{}", task.task_id, task.title, task.description);
        if let Some(guidance) = self.guidance_prompts.lock().unwrap().remove(&task.task_id) {
            prompt.push_str("\n\nGuidance from the previous attempt: ");
            prompt.push_str(&guidance);
        }

        let run_future = self.executor.run(&task.task_id, &acquired.worktree_path, &prompt);
        let outcome = match tokio::time::timeout(self.task_timeout, run_future).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let outcome = self.handle_error(task, TaskError::timeout()).await;
                return (outcome, Some(worktree_path), false);
            }
        };

        if !outcome.success {
            let raw = outcome.raw_error.clone().unwrap_or_default();
            let classification = classifier::classify(&raw);
            let outcome = self
                .handle_error(task, TaskError::new(ErrorKind::Unknown, classification.details.clone(), classification.pattern.is_retryable(), raw))
                .await;
            return (outcome, Some(worktree_path), false);
        }

        // Re-check the claim was not stolen mid-run.
        if !self.kanban.renew(&task.task_id, self.holder_id).await.map(|r| r.ok).unwrap_or(false) {
            let outcome = self.handle_error(task, TaskError::claim_conflict(self.holder_id)).await;
            return (outcome, Some(worktree_path), false);
        }

        let post_head = self.git.run_git(&acquired.worktree_path, &["rev-parse", "HEAD"]).ok().map(|o| o.stdout.trim().to_string());
        let has_new_commits = outcome.has_commits && pre_head != post_head;

        if !has_new_commits {
            let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
            self.set_cooldown(&task.task_id);
            self.event_bus.emit("task.noop", Some(task.task_id.clone()), serde_json::json!({}));
            return (TaskOutcome::NoOpCooldown, Some(worktree_path), false);
        }

        if PROTECTED_BRANCHES.contains(&branch) {
            let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
            self.event_bus.emit("task.push_refused_protected_branch", Some(task.task_id.clone()), serde_json::json!({}));
            return (TaskOutcome::PushFailedTodo, Some(worktree_path), false);
        }

        if !self.push_branch(&acquired.worktree_path, branch, base_branch) {
            let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
            self.event_bus.emit("task.push_failed", Some(task.task_id.clone()), serde_json::json!({}));
            return (TaskOutcome::PushFailedTodo, Some(worktree_path), false);
        }

        let title = format!("Bosun: {}", task.title);
        let body = task.description.clone();
        if self.kanban.create_or_update_pr(branch, base_branch, &title, &body).await.is_err() {
            let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
            return (TaskOutcome::PushFailedTodo, Some(worktree_path), false);
        }

        let _ = self.kanban.set_status(&task.task_id, TaskStatus::Inreview, "scheduler").await;
        self.recovery.lock().unwrap().reset(&task.task_id);
        self.event_bus.emit("task.completed", Some(task.task_id.clone()), serde_json::json!({}));
        self.event_bus.emit("auto-review", Some(task.task_id.clone()), serde_json::json!({}));
        (TaskOutcome::InReview, Some(worktree_path), true)
    }

    fn push_branch(&self, worktree_path: &str, branch: &str, base_branch: &str) -> bool {
        let _ = self.git.run_git(worktree_path, &["fetch", "origin", base_branch]);
        let diff = self.git.run_git(worktree_path, &["diff", "--stat", &format!("origin/{base_branch}..HEAD")]);
        if diff.as_ref().map(|d| d.stdout.trim().is_empty()).unwrap_or(true) {
            return false; // empty-diff guard
        }

        let push = self.git.run_git(worktree_path, &["push", "origin", branch]);
        match push {
            Ok(o) if o.success => true,
            _ => {
                let rebase = self.git.run_git(worktree_path, &["rebase", &format!("origin/{base_branch}")]);
                if rebase.map(|r| r.success).unwrap_or(false) {
                    self.git.run_git(worktree_path, &["push", "origin", branch]).map(|o| o.success).unwrap_or(false)
                } else {
                    false
                }
            }
        }
    }

    async fn handle_error(&self, task: &Task, error: TaskError) -> TaskOutcome {
        let classification = classifier::classify(&error.source_output);
        let outcome = self.recovery.lock().unwrap().record_error(&task.task_id, &classification);
        self.event_bus.emit(
            "task.failed",
            Some(task.task_id.clone()),
            serde_json::json!({ "kind": format!("{:?}", error.kind), "message": error.message }),
        );

        match outcome.action {
            Action::Block => {
                let _ = self.kanban.set_status(&task.task_id, TaskStatus::Blocked, "scheduler").await;
                TaskOutcome::Blocked
            }
            Action::RetryWithPrompt { prompt, .. } => {
                let guidance = session_analyzer_guidance(&error.source_output).unwrap_or(prompt);
                self.guidance_prompts.lock().unwrap().insert(task.task_id.clone(), guidance);
                let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
                TaskOutcome::PushFailedTodo
            }
            Action::PauseExecutor => {
                self.event_bus.emit("executor-paused", None, serde_json::json!({ "reason": outcome.reason }));
                let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
                TaskOutcome::PushFailedTodo
            }
            _ => {
                let _ = self.kanban.set_status(&task.task_id, TaskStatus::Todo, "scheduler").await;
                TaskOutcome::PushFailedTodo
            }
        }
    }
}

/// Reconstructs a crude session-message sequence from the combined agent
/// output and runs the session-sequence analyzer over it, so a detected
/// behavioral pattern (stuck plan, false completion, tool loop, ...) can
/// sharpen the recovery policy's canned retry prompt with a targeted one.
fn session_analyzer_guidance(combined_output: &str) -> Option<String> {
    use bosun_agents::session_analyzer::{analyze, MessageKind, SessionMessage};

    let messages: Vec<SessionMessage> = combined_output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            if l.contains("git commit") || l.contains("git push") {
                SessionMessage { kind: MessageKind::ToolCall, content: l.to_string(), tool_name: Some("bash".to_string()) }
            } else {
                SessionMessage { kind: MessageKind::AgentMessage, content: l.to_string(), tool_name: None }
            }
        })
        .collect();

    analyze(&messages).primary.map(|p| p.intervention_prompt().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::ScriptedExecutor;
    use crate::executor::AgentOutcome;
    use bosun_core::git_runner::GitOutput;
    use bosun_kanban::adapter::{ClaimOutcome, PrResult, RenewOutcome};

    /// Advances the reported HEAD on each `rev-parse` call so a scheduler run
    /// that commits looks like it actually moved HEAD, the way a real repo
    /// would between the pre- and post-execution `rev-parse` calls.
    #[derive(Default)]
    struct AlwaysOkGit {
        rev_parse_calls: std::sync::atomic::AtomicU64,
    }
    impl GitRunner for AlwaysOkGit {
        fn run_git(&self, _dir: &str, args: &[&str]) -> Result<GitOutput, String> {
            if args.first() == Some(&"diff") {
                return Ok(GitOutput { success: true, stdout: "1 file changed".into(), stderr: String::new() });
            }
            if args.first() == Some(&"rev-parse") {
                let n = self.rev_parse_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Ok(GitOutput { success: true, stdout: format!("rev-{n}"), stderr: String::new() });
            }
            Ok(GitOutput { success: true, stdout: "deadbeef".into(), stderr: String::new() })
        }
    }

    /// Local stand-in for a kanban backend: the real `MockKanbanAdapter` in
    /// `bosun-kanban` is only visible within that crate's own test build.
    #[derive(Default)]
    struct FakeKanban {
        tasks: Mutex<Vec<Task>>,
        prs_created: Mutex<Vec<(String, String)>>,
        renew_calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl KanbanAdapter for FakeKanban {
        async fn list(&self, status: TaskStatus) -> bosun_kanban::adapter::Result<Vec<Task>> {
            Ok(self.tasks.lock().unwrap().iter().filter(|t| t.status == status).cloned().collect())
        }
        async fn claim(&self, _task_id: &str, _holder_id: Uuid, _ttl_minutes: i64) -> bosun_kanban::adapter::Result<ClaimOutcome> {
            Ok(ClaimOutcome { ok: true, existing_holder: None })
        }
        async fn renew(&self, _task_id: &str, _holder_id: Uuid) -> bosun_kanban::adapter::Result<RenewOutcome> {
            self.renew_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(RenewOutcome { ok: true })
        }
        async fn release(&self, _task_id: &str, _holder_id: Uuid) -> bosun_kanban::adapter::Result<()> {
            Ok(())
        }
        async fn set_status(&self, task_id: &str, status: TaskStatus, _source: &str) -> bosun_kanban::adapter::Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().iter_mut().find(|t| t.task_id == task_id) {
                t.set_status(status);
            }
            Ok(())
        }
        async fn create_or_update_pr(&self, branch: &str, base_branch: &str, _title: &str, _body: &str) -> bosun_kanban::adapter::Result<PrResult> {
            self.prs_created.lock().unwrap().push((branch.to_string(), base_branch.to_string()));
            Ok(PrResult { pr_number: 1, pr_url: format!("https://example.test/{branch}") })
        }
    }

    fn kanban_with_task(task: Task) -> Arc<FakeKanban> {
        let adapter = FakeKanban::default();
        adapter.tasks.lock().unwrap().push(task);
        Arc::new(adapter)
    }

    fn make_scheduler(repo_root: &std::path::Path, kanban: Arc<FakeKanban>, executor_outcomes: Vec<AgentOutcome>) -> Scheduler {
        let worktrees = Arc::new(WorktreeManager::new(repo_root, Box::new(AlwaysOkGit::default())));
        Scheduler::new(
            Uuid::new_v4(),
            kanban,
            worktrees,
            Arc::new(AlwaysOkGit::default()),
            Arc::new(ScriptedExecutor::new(executor_outcomes)),
            Arc::new(EventBus::new()),
            3,
            0,
            180,
            300_000,
            Duration::from_secs(5),
        )
    }

    /// Like `ScriptedExecutor` but holds the slot for `delay` before
    /// returning, so a test can observe the auto-renew timer tick at least
    /// once during a single task run.
    struct SlowExecutor {
        delay: Duration,
        outcome: AgentOutcome,
    }
    #[async_trait::async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn run(&self, _task_id: &str, _worktree_path: &str, _prompt: &str) -> AgentOutcome {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn claim_is_renewed_periodically_while_the_agent_is_still_running() {
        let repo = tempfile::tempdir().unwrap();
        let mut task = Task::new("T1", "do the thing");
        task.branch_name = Some("bosun/T1".into());
        task.base_branch = Some("main".into());
        let kanban = kanban_with_task(task.clone());

        let worktrees = Arc::new(WorktreeManager::new(repo.path(), Box::new(AlwaysOkGit::default())));
        let scheduler = Scheduler::new(
            Uuid::new_v4(),
            kanban.clone(),
            worktrees,
            Arc::new(AlwaysOkGit::default()),
            Arc::new(SlowExecutor {
                delay: Duration::from_millis(60),
                outcome: AgentOutcome { success: true, has_commits: true, raw_error: None },
            }),
            Arc::new(EventBus::new()),
            3,
            0,
            180,
            10, // renew_interval_ms: short enough to tick several times during the 60ms run
            Duration::from_secs(5),
        );

        let outcome = scheduler.run_task(task).await;
        assert_eq!(outcome, TaskOutcome::InReview);
        // One renew from the background timer plus the post-run claim check.
        assert!(kanban.renew_calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn happy_path_moves_task_to_inreview_and_creates_pr() {
        let repo = tempfile::tempdir().unwrap();
        let mut task = Task::new("T1", "do the thing");
        task.branch_name = Some("bosun/T1".into());
        task.base_branch = Some("main".into());
        let kanban = kanban_with_task(task.clone());

        let scheduler = make_scheduler(
            repo.path(),
            kanban.clone(),
            vec![AgentOutcome { success: true, has_commits: true, raw_error: None }],
        );

        let outcome = scheduler.run_task(task).await;
        assert_eq!(outcome, TaskOutcome::InReview);
        assert_eq!(kanban.prs_created.lock().unwrap().len(), 1);
        assert_eq!(scheduler.slots.in_use(), 0);
    }

    #[tokio::test]
    async fn noop_completion_returns_to_todo_with_cooldown() {
        let repo = tempfile::tempdir().unwrap();
        let mut task = Task::new("T1", "do the thing");
        task.branch_name = Some("bosun/T1".into());
        task.base_branch = Some("feature-base".into());
        let kanban = kanban_with_task(task.clone());

        let scheduler = make_scheduler(
            repo.path(),
            kanban,
            vec![AgentOutcome { success: true, has_commits: false, raw_error: None }],
        );

        let outcome = scheduler.run_task(task.clone()).await;
        assert_eq!(outcome, TaskOutcome::NoOpCooldown);
        assert!(scheduler.in_cooldown("T1"));

        // Re-admission is refused while cooldown is active.
        let second = scheduler.run_task(task).await;
        assert_eq!(second, TaskOutcome::NoOpCooldown);
    }

    #[tokio::test]
    async fn protected_branch_push_is_refused() {
        let repo = tempfile::tempdir().unwrap();
        let mut task = Task::new("T1", "do the thing");
        task.branch_name = Some("main".into());
        task.base_branch = Some("main".into());
        let kanban = kanban_with_task(task.clone());

        let scheduler = make_scheduler(
            repo.path(),
            kanban,
            vec![AgentOutcome { success: true, has_commits: true, raw_error: None }],
        );

        let outcome = scheduler.run_task(task).await;
        assert_eq!(outcome, TaskOutcome::PushFailedTodo);
    }

    #[tokio::test]
    async fn slot_released_even_when_agent_run_fails() {
        let repo = tempfile::tempdir().unwrap();
        let mut task = Task::new("T1", "do the thing");
        task.branch_name = Some("bosun/T1".into());
        task.base_branch = Some("main".into());
        let kanban = kanban_with_task(task.clone());

        let scheduler = make_scheduler(
            repo.path(),
            kanban,
            vec![AgentOutcome { success: false, has_commits: false, raw_error: Some("500 internal server error".into()) }],
        );

        let outcome = scheduler.run_task(task).await;
        assert!(matches!(outcome, TaskOutcome::PushFailedTodo | TaskOutcome::Blocked));
        assert_eq!(scheduler.slots.in_use(), 0);
    }
}
