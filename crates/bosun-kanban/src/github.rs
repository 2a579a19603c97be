//! GitHub-backed kanban adapter. Issues are tasks; status is tracked via a
//! `status:<name>` label since issues have no native status field. Claim
//! bookkeeping is delegated to the shared [`bosun_core::persistence::Db`] —
//! GitHub itself has no notion of a claim/lease.

use async_trait::async_trait;
use bosun_core::persistence::Db;
use bosun_core::types::{Task, TaskStatus};
use octocrab::Octocrab;
use uuid::Uuid;

use crate::adapter::{ClaimOutcome, KanbanAdapter, KanbanError, PrResult, RenewOutcome, Result};

const STATUS_LABEL_PREFIX: &str = "status:";

pub struct GitHubAdapter {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    db: Db,
}

impl GitHubAdapter {
    pub fn new(token: String, owner: impl Into<String>, repo: impl Into<String>, db: Db) -> Result<Self> {
        let octocrab = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        Ok(Self { octocrab, owner: owner.into(), repo: repo.into(), db })
    }

    pub fn from_env(db: Db) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .map_err(|_| KanbanError::Backend("GITHUB_TOKEN not set".into()))?;
        let owner = std::env::var("GITHUB_OWNER")
            .map_err(|_| KanbanError::Backend("GITHUB_OWNER not set".into()))?;
        let repo = std::env::var("GITHUB_REPO")
            .map_err(|_| KanbanError::Backend("GITHUB_REPO not set".into()))?;
        Self::new(token, owner, repo, db)
    }

    fn status_label(status: TaskStatus) -> String {
        format!("{STATUS_LABEL_PREFIX}{status}")
    }

    fn status_from_labels(labels: &[octocrab::models::Label]) -> TaskStatus {
        labels
            .iter()
            .find_map(|l| l.name.strip_prefix(STATUS_LABEL_PREFIX))
            .and_then(|s| match s {
                "backlog" => Some(TaskStatus::Backlog),
                "todo" => Some(TaskStatus::Todo),
                "inprogress" => Some(TaskStatus::Inprogress),
                "inreview" => Some(TaskStatus::Inreview),
                "done" => Some(TaskStatus::Done),
                "cancelled" => Some(TaskStatus::Cancelled),
                "blocked" => Some(TaskStatus::Blocked),
                _ => None,
            })
            .unwrap_or(TaskStatus::Backlog)
    }

    fn issue_to_task(issue: octocrab::models::issues::Issue) -> Task {
        let status = Self::status_from_labels(&issue.labels);
        let mut task = Task::new(issue.number.to_string(), issue.title);
        task.description = issue.body.unwrap_or_default();
        task.status = status;
        task.creator_login = Some(issue.user.login);
        task.tags = issue
            .labels
            .iter()
            .filter(|l| !l.name.starts_with(STATUS_LABEL_PREFIX))
            .map(|l| l.name.clone())
            .collect();
        task.created_at = issue.created_at;
        task.updated_at = issue.updated_at;
        task
    }
}

#[async_trait]
impl KanbanAdapter for GitHubAdapter {
    async fn list(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let handler = self.octocrab.issues(&self.owner, &self.repo);
        let page = handler
            .list()
            .state(octocrab::params::State::Open)
            .labels(&[Self::status_label(status)])
            .send()
            .await
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        Ok(page.items.into_iter().map(Self::issue_to_task).collect())
    }

    async fn claim(&self, task_id: &str, holder_id: Uuid, ttl_minutes: i64) -> Result<ClaimOutcome> {
        let renew_interval_ms = bosun_core::types::Claim::default_renew_interval_ms();
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
        let number: u64 = task_id
            .parse()
            .map_err(|_| KanbanError::NotFound(task_id.to_string()))?;

        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .get(number)
            .await
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        let mut labels: Vec<String> = issue
            .labels
            .iter()
            .filter(|l| !l.name.starts_with(STATUS_LABEL_PREFIX))
            .map(|l| l.name.clone())
            .collect();
        labels.push(Self::status_label(status));

        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .labels(&labels)
            .send()
            .await
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        if status.is_terminal() {
            self.octocrab
                .issues(&self.owner, &self.repo)
                .update(number)
                .state(octocrab::models::IssueState::Closed)
                .send()
                .await
                .map_err(|e| KanbanError::Backend(e.to_string()))?;
        }

        Ok(())
    }

    async fn create_or_update_pr(
        &self,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrResult> {
        let pulls = self.octocrab.pulls(&self.owner, &self.repo);

        let existing = pulls
            .list()
            .head(format!("{}:{}", self.owner, branch))
            .state(octocrab::params::State::Open)
            .send()
            .await
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        if let Some(pr) = existing.items.into_iter().next() {
            let updated = pulls
                .update(pr.number)
                .title(title)
                .body(body)
                .send()
                .await
                .map_err(|e| KanbanError::Backend(e.to_string()))?;
            return Ok(PrResult {
                pr_number: updated.number,
                pr_url: updated.html_url.map(|u| u.to_string()).unwrap_or_default(),
            });
        }

        let pr = pulls
            .create(title, branch, base_branch)
            .body(body)
            .send()
            .await
            .map_err(|e| KanbanError::Backend(e.to_string()))?;

        Ok(PrResult {
            pr_number: pr.number,
            pr_url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
        })
    }
}
