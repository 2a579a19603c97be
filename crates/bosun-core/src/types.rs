use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    Inprogress,
    Inreview,
    Done,
    Cancelled,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::Inprogress => "inprogress",
            TaskStatus::Inreview => "inreview",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", label)
    }
}

impl TaskStatus {
    /// Whether this status may transition directly to `next` under the
    /// scheduler's per-task pipeline (see the scheduler state machine).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Backlog, Todo)
                | (Todo, Inprogress)
                | (Inprogress, Inreview)
                | (Inprogress, Todo) // cooldown / push failure
                | (Inprogress, Blocked)
                | (Inreview, Done)
                | (Inreview, Todo) // repair handoff
                | (Todo, Cancelled)
                | (Backlog, Cancelled)
                | (Inprogress, Cancelled)
                | (Blocked, Todo) // manual unblock
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub creator_login: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            tags: Vec::new(),
            branch_name: None,
            base_branch: None,
            creator_login: None,
            pr_number: None,
            pr_url: None,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// ExecutionSlot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSlot {
    pub slot_id: Uuid,
    pub task_id: String,
    pub sdk: String,
    pub branch: String,
    pub base_branch: String,
    pub allocated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: String,
    pub holder_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl_minutes: i64,
    pub renew_interval_ms: u64,
}

impl Claim {
    pub fn default_ttl_minutes() -> i64 {
        180
    }

    pub fn default_renew_interval_ms() -> u64 {
        300_000
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.acquired_at) > chrono::Duration::minutes(self.ttl_minutes)
    }
}

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub worktree_path: String,
    pub branch: String,
    pub task_id: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ErrorRecord (per-task classifier history)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub pattern: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub confidence: f64,
    pub details: String,
}

pub const ERROR_RECORD_MAX_ENTRIES: usize = 50;

// ---------------------------------------------------------------------------
// Event (event bus payload)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, task_id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            task_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Work-stream log event (§6 of the spec)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStreamEventType {
    SessionStart,
    ToolCall,
    Error,
    SessionEnd,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStreamEvent {
    pub attempt_id: Uuid,
    pub event_type: WorkStreamEventType,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub executor: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}
