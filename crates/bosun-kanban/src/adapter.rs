//! The small capability interface the scheduler requires of a kanban
//! backend (GitHub Projects v2, Jira, GitHub Issues, or a local store).
//! The scheduler is parametric over this trait and treats every backend
//! uniformly.

use async_trait::async_trait;
use bosun_core::types::{Task, TaskStatus};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum KanbanError {
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] bosun_core::persistence::DbError),
}

pub type Result<T> = std::result::Result<T, KanbanError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub ok: bool,
    pub existing_holder: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewOutcome {
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct PrResult {
    pub pr_number: u64,
    pub pr_url: String,
}

#[async_trait]
pub trait KanbanAdapter: Send + Sync {
    async fn list(&self, status: TaskStatus) -> Result<Vec<Task>>;
    async fn claim(&self, task_id: &str, holder_id: Uuid, ttl_minutes: i64) -> Result<ClaimOutcome>;
    async fn renew(&self, task_id: &str, holder_id: Uuid) -> Result<RenewOutcome>;
    async fn release(&self, task_id: &str, holder_id: Uuid) -> Result<()>;
    async fn set_status(&self, task_id: &str, status: TaskStatus, source: &str) -> Result<()>;
    async fn create_or_update_pr(
        &self,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrResult>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockKanbanAdapter {
        pub tasks: Mutex<Vec<Task>>,
        pub status_calls: Mutex<Vec<(String, TaskStatus)>>,
        pub prs_created: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl KanbanAdapter for MockKanbanAdapter {
        async fn list(&self, status: TaskStatus) -> Result<Vec<Task>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.status == status)
                .cloned()
                .collect())
        }

        async fn claim(&self, _task_id: &str, _holder_id: Uuid, _ttl_minutes: i64) -> Result<ClaimOutcome> {
            Ok(ClaimOutcome { ok: true, existing_holder: None })
        }

        async fn renew(&self, _task_id: &str, _holder_id: Uuid) -> Result<RenewOutcome> {
            Ok(RenewOutcome { ok: true })
        }

        async fn release(&self, _task_id: &str, _holder_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn set_status(&self, task_id: &str, status: TaskStatus, _source: &str) -> Result<()> {
            self.status_calls.lock().unwrap().push((task_id.to_string(), status));
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(t) = tasks.iter_mut().find(|t| t.task_id == task_id) {
                t.set_status(status);
            }
            Ok(())
        }

        async fn create_or_update_pr(
            &self,
            branch: &str,
            base_branch: &str,
            _title: &str,
            _body: &str,
        ) -> Result<PrResult> {
            self.prs_created.lock().unwrap().push((branch.to_string(), base_branch.to_string()));
            Ok(PrResult { pr_number: 1, pr_url: format!("https://example.test/pr/{branch}") })
        }
    }
}
