//! The scheduler's internal error propagation type. Distinct from the
//! `thiserror` enums in this workspace: `TaskError` is plain data that flows
//! into the classifier, not a Rust `Error` impl that propagates up a call
//! stack.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    ContentPolicy,
    RateLimit,
    TokenOverflow,
    Model,
    Request,
    Api,
    SessionExpired,
    Oom,
    Sandbox,
    Push,
    Test,
    Lint,
    Build,
    Conflict,
    PermissionWait,
    EmptyResponse,
    Unknown,
    ClaimConflict,
    WorktreeUnavailable,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub source_output: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool, source_output: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable, source_output: source_output.into() }
    }

    pub fn claim_conflict(holder: uuid::Uuid) -> Self {
        Self::new(ErrorKind::ClaimConflict, format!("already claimed by {holder}"), false, String::new())
    }

    pub fn worktree_unavailable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(ErrorKind::WorktreeUnavailable, reason.clone(), true, reason)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "operation deadline exceeded", true, String::new())
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task was cancelled", false, String::new())
    }
}
