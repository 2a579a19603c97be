//! Isolated, ref-counted git checkouts for concurrently executing tasks.
//!
//! Contract: `acquire(repo_root, branch, task_id, base_branch)` returns a
//! `WorktreeInfo`, creating the on-disk worktree only if one does not
//! already exist for this `(repo_root, branch)` pair; `release(path)` prunes
//! it. Both operations are idempotent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;

use crate::git_runner::GitRunner;
use crate::types::WorktreeInfo;

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree not found for path: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

/// Outcome of attempting to merge a worktree branch back to a base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict(Vec<String>),
    NothingToMerge,
}

#[derive(Debug, Clone)]
pub struct AcquireResult {
    pub worktree_path: String,
    pub branch: String,
    /// `true` if a new worktree was created, `false` if an existing one for
    /// this task/branch was reused.
    pub acquired: bool,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    git: Box<dyn GitRunner>,
    registry: Mutex<HashMap<(String, String), WorktreeInfo>>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, git: Box<dyn GitRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            git,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the in-memory registry with on-disk state after a crash:
    /// drop any registration whose worktree directory no longer exists, and
    /// run `git worktree prune` to clear dangling administrative entries.
    pub fn prune_sweep(&self) -> Result<()> {
        let repo_root_str = self.repo_root.to_str().unwrap_or(".");
        self.git
            .run_git(repo_root_str, &["worktree", "prune"])
            .map_err(WorktreeManagerError::GitCommand)?;

        let mut registry = self.registry.lock().unwrap();
        registry.retain(|_, info| Path::new(&info.worktree_path).exists());
        Ok(())
    }

    /// Idempotent: reuses an existing worktree for this task's branch if one
    /// is already registered, otherwise creates one off `base_branch`.
    pub fn acquire(
        &self,
        branch: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Result<AcquireResult> {
        let key = (self.repo_root.to_string_lossy().to_string(), branch.to_string());

        {
            let registry = self.registry.lock().unwrap();
            if let Some(existing) = registry.get(&key) {
                if existing.task_id == task_id {
                    return Ok(AcquireResult {
                        worktree_path: existing.worktree_path.clone(),
                        branch: branch.to_string(),
                        acquired: false,
                    });
                }
            }
        }

        let wt_path = self.worktree_path_for(branch);
        let wt_path_str = wt_path.to_str().unwrap_or(".").to_string();
        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo_root_str = self.repo_root.to_str().unwrap_or(".");
        let output = self
            .git
            .run_git(
                repo_root_str,
                &["worktree", "add", "-b", branch, &wt_path_str, base_branch],
            )
            .map_err(WorktreeManagerError::GitCommand)?;

        if !output.success {
            return Err(WorktreeManagerError::GitCommand(output.stderr));
        }

        let info = WorktreeInfo {
            worktree_path: wt_path_str.clone(),
            branch: branch.to_string(),
            task_id: task_id.to_string(),
            base_branch: base_branch.to_string(),
            created_at: Utc::now(),
        };
        self.registry.lock().unwrap().insert(key, info);

        Ok(AcquireResult {
            worktree_path: wt_path_str,
            branch: branch.to_string(),
            acquired: true,
        })
    }

    /// Idempotent: a second release of the same path is a no-op. When
    /// `pr_opened` is `false` the task-scoped local branch created by
    /// `acquire` is deleted along with the worktree, since nothing else
    /// references it; when `true` the branch is left for the open PR.
    pub fn release(&self, worktree_path: &str, pr_opened: bool) -> Result<()> {
        let entry = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .find(|(_, info)| info.worktree_path == worktree_path)
                .map(|(k, info)| (k.clone(), info.branch.clone()))
        };
        let Some((key, branch)) = entry else {
            return Ok(());
        };

        let repo_root_str = self.repo_root.to_str().unwrap_or(".");
        let _ = self
            .git
            .run_git(repo_root_str, &["worktree", "remove", "--force", worktree_path]);
        if !pr_opened {
            let _ = self.git.run_git(repo_root_str, &["branch", "-D", &branch]);
        }
        self.registry.lock().unwrap().remove(&key);
        Ok(())
    }

    fn worktree_path_for(&self, branch: &str) -> PathBuf {
        let sanitized = sanitize_branch(branch);
        self.repo_root.join(".worktrees").join(sanitized)
    }

    /// Fetch, then attempt a no-ff merge of `branch` into `base_branch`.
    pub fn merge_to_base(&self, worktree_path: &str, base_branch: &str) -> Result<MergeResult> {
        self.git
            .run_git(worktree_path, &["fetch", "origin", base_branch])
            .map_err(WorktreeManagerError::GitCommand)?;

        let diff = self
            .git
            .run_git(worktree_path, &["diff", "--stat", &format!("origin/{base_branch}"), "HEAD"])
            .map_err(WorktreeManagerError::GitCommand)?;
        if diff.stdout.trim().is_empty() {
            return Ok(MergeResult::NothingToMerge);
        }

        let merge = self
            .git
            .run_git(
                worktree_path,
                &["merge", "--no-ff", "--no-commit", &format!("origin/{base_branch}")],
            )
            .map_err(WorktreeManagerError::GitCommand)?;

        if merge.success {
            self.git
                .run_git(worktree_path, &["commit", "--no-edit"])
                .map_err(WorktreeManagerError::GitCommand)?;
            return Ok(MergeResult::Success);
        }

        let conflicts = self
            .git
            .run_git(worktree_path, &["diff", "--name-only", "--diff-filter=U"])
            .map_err(WorktreeManagerError::GitCommand)?;
        let files: Vec<String> = conflicts
            .stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.git.run_git(worktree_path, &["merge", "--abort"]).ok();
        Ok(MergeResult::Conflict(files))
    }
}

fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_runner::mock::MockGitRunner;
    use std::sync::Arc;

    fn manager_with(responses: Vec<std::result::Result<crate::git_runner::GitOutput, String>>) -> (WorktreeManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::new(dir.path(), Box::new(MockGitRunner::new(responses)));
        (mgr, dir)
    }

    #[test]
    fn acquire_creates_worktree() {
        let (mgr, _dir) = manager_with(vec![Ok(MockGitRunner::ok(""))]);
        let result = mgr.acquire("task/t1", "T1", "main").unwrap();
        assert!(result.acquired);
        assert!(result.worktree_path.ends_with("task-t1"));
    }

    #[test]
    fn acquire_is_idempotent_for_same_task() {
        let (mgr, _dir) = manager_with(vec![Ok(MockGitRunner::ok(""))]);
        let first = mgr.acquire("task/t1", "T1", "main").unwrap();
        let second = mgr.acquire("task/t1", "T1", "main").unwrap();
        assert!(!second.acquired);
        assert_eq!(first.worktree_path, second.worktree_path);
    }

    #[test]
    fn release_twice_is_noop() {
        let (mgr, _dir) = manager_with(vec![
            Ok(MockGitRunner::ok("")), // worktree add
            Ok(MockGitRunner::ok("")), // worktree remove
            Ok(MockGitRunner::ok("")), // branch -D
        ]);
        let result = mgr.acquire("task/t1", "T1", "main").unwrap();
        mgr.release(&result.worktree_path, false).unwrap();
        mgr.release(&result.worktree_path, false).unwrap();
    }

    /// Records every invocation (unlike `MockGitRunner`, whose call log is
    /// private to its own test module) so these tests can assert on exactly
    /// which git subcommands `release` issued.
    #[derive(Default)]
    struct RecordingGit {
        calls: Mutex<Vec<Vec<String>>>,
    }
    impl GitRunner for RecordingGit {
        fn run_git(&self, _dir: &str, args: &[&str]) -> std::result::Result<crate::git_runner::GitOutput, String> {
            self.calls.lock().unwrap().push(args.iter().map(|s| s.to_string()).collect());
            Ok(MockGitRunner::ok(""))
        }
    }

    #[test]
    fn release_without_pr_deletes_local_branch() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingGit::default());
        let mgr = WorktreeManager::new(dir.path(), Box::new(RecorderHandle(recorder.clone())));

        let result = mgr.acquire("task/t1", "T1", "main").unwrap();
        mgr.release(&result.worktree_path, false).unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c[0] == "branch" && c[1] == "-D" && c[2] == "task/t1"));
    }

    #[test]
    fn release_with_pr_opened_keeps_local_branch() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingGit::default());
        let mgr = WorktreeManager::new(dir.path(), Box::new(RecorderHandle(recorder.clone())));

        let result = mgr.acquire("task/t1", "T1", "main").unwrap();
        mgr.release(&result.worktree_path, true).unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert!(!calls.iter().any(|c| c[0] == "branch" && c[1] == "-D"));
    }

    /// `GitRunner` wrapper over a shared `Arc<RecordingGit>` so the test can
    /// keep its own handle to the recorder after handing a `Box<dyn
    /// GitRunner>` to the manager.
    struct RecorderHandle(Arc<RecordingGit>);
    impl GitRunner for RecorderHandle {
        fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<crate::git_runner::GitOutput, String> {
            self.0.run_git(dir, args)
        }
    }

    #[test]
    fn merge_reports_nothing_to_merge() {
        let (mgr, _dir) = manager_with(vec![
            Ok(MockGitRunner::ok("")), // fetch
            Ok(MockGitRunner::ok("")), // diff --stat empty
        ]);
        let result = mgr.merge_to_base("/tmp/wt", "main").unwrap();
        assert_eq!(result, MergeResult::NothingToMerge);
    }

    #[test]
    fn merge_reports_conflict_files() {
        let (mgr, _dir) = manager_with(vec![
            Ok(MockGitRunner::ok("")),              // fetch
            Ok(MockGitRunner::ok(" 1 file changed")), // diff --stat
            Ok(crate::git_runner::GitOutput { success: false, stdout: String::new(), stderr: "conflict".into() }), // merge
            Ok(MockGitRunner::ok("src/lib.rs\n")),  // diff --name-only -U
            Ok(MockGitRunner::ok("")),              // merge --abort
        ]);
        let result = mgr.merge_to_base("/tmp/wt", "main").unwrap();
        assert_eq!(result, MergeResult::Conflict(vec!["src/lib.rs".to_string()]));
    }
}
