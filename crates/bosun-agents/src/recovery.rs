//! Recovery policy: turns a classifier verdict into a scheduler action.
//! The scheduler never retries on its own — this is the sole authority.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::classifier::{Classification, ErrorPattern};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const RATE_LIMIT_COOLDOWN_MS: u64 = 60_000;
const RATE_LIMIT_HIT_THRESHOLD: usize = 3;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Block,
    RetryWithPrompt { attempt: u32, max: u32, prompt: String },
    Cooldown { ms: u64, attempt: u32, max: u32 },
    PauseExecutor,
    NewSession,
    Manual,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub action: Action,
    pub reason: String,
    pub error_count: u32,
}

#[derive(Default)]
struct TaskRecord {
    consecutive_errors: u32,
    retries_by_pattern: HashMap<&'static str, u32>,
}

pub struct RecoveryPolicy {
    records: HashMap<String, TaskRecord>,
    rate_limit_hits: Vec<Instant>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self { records: HashMap::new(), rate_limit_hits: Vec::new() }
    }

    pub fn record_error(&mut self, task_id: &str, classification: &Classification) -> RecoveryOutcome {
        let record = self.records.entry(task_id.to_string()).or_default();
        record.consecutive_errors += 1;
        let error_count = record.consecutive_errors;

        if error_count >= MAX_CONSECUTIVE_ERRORS {
            return RecoveryOutcome {
                action: Action::Block,
                reason: "max consecutive errors reached".to_string(),
                error_count,
            };
        }

        if classification.pattern == ErrorPattern::RateLimit {
            self.rate_limit_hits.push(Instant::now());
        }

        let retries = record.retries_by_pattern.entry(classification.pattern.as_str()).or_insert(0);

        let (action, reason) = match classification.pattern {
            ErrorPattern::AuthError | ErrorPattern::ModelError | ErrorPattern::ContentPolicy => {
                (Action::Block, "non-retryable pattern".to_string())
            }
            ErrorPattern::RequestError => {
                bump_or_block(retries, 2, |attempt, max| Action::RetryWithPrompt {
                    attempt,
                    max,
                    prompt: "retry the request with additional context".to_string(),
                })
            }
            ErrorPattern::RateLimit => {
                let cutoff = Instant::now() - RATE_LIMIT_WINDOW;
                self.rate_limit_hits.retain(|t| *t >= cutoff);
                if self.rate_limit_hits.len() > RATE_LIMIT_HIT_THRESHOLD {
                    (Action::PauseExecutor, "rate limit hit threshold exceeded globally".to_string())
                } else {
                    (
                        Action::Cooldown { ms: RATE_LIMIT_COOLDOWN_MS, attempt: *retries + 1, max: u32::MAX },
                        "rate limited".to_string(),
                    )
                }
            }
            ErrorPattern::TokenOverflow | ErrorPattern::SessionExpired => {
                (Action::NewSession, "fresh context required".to_string())
            }
            ErrorPattern::ApiError => {
                bump_or_block_cooldown(retries, 2, |attempt, max| Action::Cooldown { ms: 30_000, attempt, max })
            }
            ErrorPattern::BuildFailure | ErrorPattern::TestFailure | ErrorPattern::PushFailure => {
                bump_or_manual(retries, 2, |attempt, max| Action::RetryWithPrompt {
                    attempt,
                    max,
                    prompt: format!("fix the {} and retry", classification.pattern.as_str()),
                })
            }
            ErrorPattern::LintFailure => bump_or_manual(retries, 2, |attempt, max| Action::RetryWithPrompt {
                attempt,
                max,
                prompt: "fix the lint failure and retry".to_string(),
            }),
            ErrorPattern::GitConflict => bump_or_manual(retries, 1, |attempt, max| Action::RetryWithPrompt {
                attempt,
                max,
                prompt: "resolve the merge conflict".to_string(),
            }),
            ErrorPattern::CodexSandbox => {
                bump_or_block(retries, 1, |attempt, max| Action::RetryWithPrompt {
                    attempt,
                    max,
                    prompt: "retry within sandbox constraints".to_string(),
                })
            }
            ErrorPattern::PlanStuck => (
                Action::RetryWithPrompt { attempt: *retries + 1, max: u32::MAX, prompt: "implement now".to_string() },
                "plan stuck".to_string(),
            ),
            ErrorPattern::OomKill | ErrorPattern::Oom => (Action::Block, "memory exhaustion".to_string()),
            ErrorPattern::PermissionWait | ErrorPattern::EmptyResponse | ErrorPattern::Unknown => {
                bump_or_manual(retries, 2, |attempt, max| Action::Cooldown { ms: 30_000, attempt, max })
            }
        };
        *retries += 1;

        RecoveryOutcome { action, reason, error_count }
    }

    pub fn reset(&mut self, task_id: &str) {
        self.records.remove(task_id);
    }

    pub fn should_pause_executor(&mut self) -> bool {
        let cutoff = Instant::now() - RATE_LIMIT_WINDOW;
        self.rate_limit_hits.retain(|t| *t >= cutoff);
        self.rate_limit_hits.len() > RATE_LIMIT_HIT_THRESHOLD
    }
}

fn bump_or_block(retries: &mut u32, max: u32, make_action: impl Fn(u32, u32) -> Action) -> (Action, String) {
    if *retries < max {
        (make_action(*retries + 1, max), "retrying with guidance prompt".to_string())
    } else {
        (Action::Block, "retry budget exhausted".to_string())
    }
}

fn bump_or_manual(retries: &mut u32, max: u32, make_action: impl Fn(u32, u32) -> Action) -> (Action, String) {
    if *retries < max {
        (make_action(*retries + 1, max), "retrying with targeted prompt".to_string())
    } else {
        (Action::Manual, "retry budget exhausted, needs human".to_string())
    }
}

fn bump_or_block_cooldown(retries: &mut u32, max: u32, make_action: impl Fn(u32, u32) -> Action) -> (Action, String) {
    if *retries < max {
        (make_action(*retries + 1, max), "cooling down".to_string())
    } else {
        (Action::Block, "cooldown budget exhausted".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, Severity};

    fn classification(pattern: ErrorPattern) -> Classification {
        Classification { pattern, confidence: 0.9, details: String::new(), raw_match: String::new(), severity: Severity::Medium }
    }

    #[test]
    fn max_consecutive_errors_blocks_unconditionally() {
        let mut policy = RecoveryPolicy::new();
        for _ in 0..4 {
            policy.record_error("T1", &classification(ErrorPattern::RequestError));
        }
        let outcome = policy.record_error("T1", &classification(ErrorPattern::RequestError));
        assert_eq!(outcome.action, Action::Block);
        assert_eq!(outcome.error_count, 5);
    }

    #[test]
    fn auth_error_blocks_immediately() {
        let mut policy = RecoveryPolicy::new();
        let outcome = policy.record_error("T1", &classify("401 unauthorized"));
        assert_eq!(outcome.action, Action::Block);
    }

    #[test]
    fn rate_limit_escalates_to_pause_after_threshold() {
        let mut policy = RecoveryPolicy::new();
        for i in 0..3 {
            let outcome = policy.record_error(&format!("T{i}"), &classification(ErrorPattern::RateLimit));
            assert_ne!(outcome.action, Action::PauseExecutor);
        }
        let outcome = policy.record_error("T4", &classification(ErrorPattern::RateLimit));
        assert_eq!(outcome.action, Action::PauseExecutor);
    }

    #[test]
    fn reset_clears_consecutive_counter() {
        let mut policy = RecoveryPolicy::new();
        policy.record_error("T1", &classification(ErrorPattern::RequestError));
        policy.reset("T1");
        let outcome = policy.record_error("T1", &classification(ErrorPattern::RequestError));
        assert_eq!(outcome.error_count, 1);
    }
}
