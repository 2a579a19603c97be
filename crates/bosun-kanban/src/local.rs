//! Fully local kanban backend for operators running without GitHub/Jira — a
//! single shared [`Db`] holds both the task table and the claim table, so
//! offline mode exercises the same scheduler code path as a networked
//! backend.

use async_trait::async_trait;
use bosun_core::persistence::Db;
use bosun_core::types::{Claim, Task, TaskStatus};
use uuid::Uuid;

use crate::adapter::{ClaimOutcome, KanbanAdapter, PrResult, RenewOutcome, Result};

pub struct LocalAdapter {
    db: Db,
}

impl LocalAdapter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create_task(&self, task: Task) -> Result<()> {
        self.db.task_upsert(task).await?;
        Ok(())
    }
}

#[async_trait]
impl KanbanAdapter for LocalAdapter {
    async fn list(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self.db.tasks_by_status(status).await?)
    }

    async fn claim(&self, task_id: &str, holder_id: Uuid, ttl_minutes: i64) -> Result<ClaimOutcome> {
        let renew_interval_ms = Claim::default_renew_interval_ms();
        match self.db.claim_acquire(task_id, holder_id, ttl_minutes, renew_interval_ms).await? {
            None => Ok(ClaimOutcome { ok: true, existing_holder: None }),
            Some(existing) => Ok(ClaimOutcome { ok: false, existing_holder: Some(existing) }),
        }
    }

    async fn renew(&self, task_id: &str, holder_id: Uuid) -> Result<RenewOutcome> {
        match self.db.claim_renew(task_id, holder_id).await? {
            Ok(()) => Ok(RenewOutcome { ok: true }),
            Err(_other_holder) => Ok(RenewOutcome { ok: false }),
        }
    }

    async fn release(&self, task_id: &str, holder_id: Uuid) -> Result<()> {
        self.db.claim_release(task_id, holder_id).await?;
        Ok(())
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus, _source: &str) -> Result<()> {
        self.db.task_set_status(task_id, status).await?;
        Ok(())
    }

    async fn create_or_update_pr(
        &self,
        branch: &str,
        _base_branch: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PrResult> {
        // No external PR system in local mode — the branch name doubles as
        // the PR identifier so downstream code has something stable to log.
        Ok(PrResult { pr_number: 0, pr_url: format!("local://{branch}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_status_and_set_status_moves_task() {
        let db = Db::open_in_memory().await.unwrap();
        let adapter = LocalAdapter::new(db);
        adapter.create_task(Task::new("T1", "do the thing")).await.unwrap();

        let todo = adapter.list(TaskStatus::Todo).await.unwrap();
        assert_eq!(todo.len(), 1);

        adapter.set_status("T1", TaskStatus::Inprogress, "scheduler").await.unwrap();
        assert!(adapter.list(TaskStatus::Todo).await.unwrap().is_empty());
        assert_eq!(adapter.list(TaskStatus::Inprogress).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_conflict_then_release_allows_reacquire() {
        let db = Db::open_in_memory().await.unwrap();
        let adapter = LocalAdapter::new(db);
        adapter.create_task(Task::new("T1", "do the thing")).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(adapter.claim("T1", a, 180).await.unwrap().ok);
        let outcome = adapter.claim("T1", b, 180).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.existing_holder, Some(a));

        adapter.release("T1", a).await.unwrap();
        assert!(adapter.claim("T1", b, 180).await.unwrap().ok);
    }

    #[tokio::test]
    async fn create_or_update_pr_returns_local_url() {
        let db = Db::open_in_memory().await.unwrap();
        let adapter = LocalAdapter::new(db);
        let pr = adapter.create_or_update_pr("feature/x", "main", "title", "body").await.unwrap();
        assert_eq!(pr.pr_url, "local://feature/x");
    }
}
