//! Error classifier: maps combined agent stdout/stderr to a closed pattern
//! taxonomy with a confidence score. Non-retryable patterns are listed first
//! in `PATTERN_GROUPS` so they win ties, per the classifier's tie-break rule.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPattern {
    AuthError,
    ContentPolicy,
    PlanStuck,
    RateLimit,
    TokenOverflow,
    ModelError,
    RequestError,
    ApiError,
    SessionExpired,
    OomKill,
    Oom,
    CodexSandbox,
    PushFailure,
    TestFailure,
    LintFailure,
    BuildFailure,
    GitConflict,
    PermissionWait,
    EmptyResponse,
    Unknown,
}

impl ErrorPattern {
    pub fn as_str(&self) -> &'static str {
        use ErrorPattern::*;
        match self {
            AuthError => "auth_error",
            ContentPolicy => "content_policy",
            PlanStuck => "plan_stuck",
            RateLimit => "rate_limit",
            TokenOverflow => "token_overflow",
            ModelError => "model_error",
            RequestError => "request_error",
            ApiError => "api_error",
            SessionExpired => "session_expired",
            OomKill => "oom_kill",
            Oom => "oom",
            CodexSandbox => "codex_sandbox",
            PushFailure => "push_failure",
            TestFailure => "test_failure",
            LintFailure => "lint_failure",
            BuildFailure => "build_failure",
            GitConflict => "git_conflict",
            PermissionWait => "permission_wait",
            EmptyResponse => "empty_response",
            Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorPattern::AuthError | ErrorPattern::ModelError | ErrorPattern::ContentPolicy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub pattern: ErrorPattern,
    pub confidence: f64,
    pub details: String,
    pub raw_match: String,
    pub severity: Severity,
}

// Non-retryable groups come first so they win confidence ties (the
// classifier picks the highest confidence, earlier group wins on equal
// confidence).
const GROUPS: &[(ErrorPattern, f64, Severity, &[&str])] = &[
    (ErrorPattern::AuthError, 0.9, Severity::High, &[r"(?i)401 unauthorized", r"(?i)invalid api key", r"(?i)authentication failed"]),
    (ErrorPattern::ContentPolicy, 0.9, Severity::High, &[r"(?i)content policy", r"(?i)usage policy violation"]),
    (ErrorPattern::ModelError, 0.85, Severity::High, &[r"(?i)model not found", r"(?i)model overloaded"]),
    (ErrorPattern::OomKill, 0.9, Severity::Critical, &[r"(?i)oom.?killed", r"(?i)killed.*signal 9"]),
    (ErrorPattern::Oom, 0.8, Severity::High, &[r"(?i)out of memory", r"(?i)cannot allocate memory"]),
    (ErrorPattern::TokenOverflow, 0.85, Severity::Medium, &[r"(?i)context length exceeded", r"(?i)maximum context", r"(?i)token limit"]),
    (ErrorPattern::RateLimit, 0.85, Severity::Medium, &[r"(?i)rate limit", r"(?i)429 too many requests", r"(?i)quota exceeded"]),
    (ErrorPattern::SessionExpired, 0.8, Severity::Medium, &[r"(?i)session expired", r"(?i)session not found"]),
    (ErrorPattern::CodexSandbox, 0.8, Severity::Medium, &[r"(?i)sandbox.*denied", r"(?i)operation not permitted"]),
    (ErrorPattern::PushFailure, 0.75, Severity::Medium, &[r"(?i)failed to push", r"(?i)rejected.*non-fast-forward"]),
    (ErrorPattern::GitConflict, 0.8, Severity::Medium, &[r"(?i)merge conflict", r"(?i)conflict.*resolve"]),
    (ErrorPattern::TestFailure, 0.7, Severity::Medium, &[r"(?i)test(s)? failed", r"(?i)assertion failed"]),
    (ErrorPattern::LintFailure, 0.7, Severity::Low, &[r"(?i)lint(ing)? failed", r"(?i)clippy.*error"]),
    (ErrorPattern::BuildFailure, 0.7, Severity::Medium, &[r"(?i)build failed", r"(?i)compilation failed", r"(?i)error\[e\d+\]"]),
    (ErrorPattern::RequestError, 0.65, Severity::Medium, &[r"(?i)request failed", r"(?i)connection reset", r"(?i)econnrefused"]),
    (ErrorPattern::ApiError, 0.6, Severity::Medium, &[r"(?i)500 internal server error", r"(?i)502 bad gateway", r"(?i)503 service unavailable"]),
    (ErrorPattern::PermissionWait, 0.6, Severity::Low, &[r"(?i)waiting for (your )?permission", r"(?i)should i proceed"]),
    (ErrorPattern::PlanStuck, 0.55, Severity::Low, &[r"(?i)here's the plan", r"(?i)ready to begin"]),
    (ErrorPattern::EmptyResponse, 0.5, Severity::Low, &[r"^\s*$"]),
];

type CompiledGroup = (ErrorPattern, f64, Severity, Vec<Regex>);

fn compiled() -> &'static Vec<CompiledGroup> {
    static CELL: OnceLock<Vec<CompiledGroup>> = OnceLock::new();
    CELL.get_or_init(|| {
        GROUPS
            .iter()
            .map(|(p, c, s, patterns)| {
                let regexes = patterns.iter().map(|p| Regex::new(p).expect("static regex")).collect();
                (*p, *c, *s, regexes)
            })
            .collect()
    })
}

/// Classify the combined stdout+stderr output of an agent run.
pub fn classify(output: &str) -> Classification {
    let mut best: Option<(ErrorPattern, f64, Severity, String)> = None;

    for (pattern, base_confidence, severity, regexes) in compiled() {
        let mut hits = 0usize;
        let mut raw_match = String::new();
        for re in regexes {
            if let Some(m) = re.find(output) {
                hits += 1;
                if raw_match.is_empty() {
                    raw_match = m.as_str().to_string();
                }
            }
        }
        if hits == 0 {
            continue;
        }
        let confidence = (base_confidence + 0.05 * (hits - 1) as f64).min(1.0);
        let better = match &best {
            None => true,
            Some((_, best_conf, ..)) => confidence > *best_conf,
        };
        if better {
            best = Some((*pattern, confidence, *severity, raw_match));
        }
    }

    match best {
        Some((pattern, confidence, severity, raw_match)) => Classification {
            pattern,
            confidence,
            details: format!("matched {} pattern(s) for {}", 1, pattern.as_str()),
            raw_match,
            severity,
        },
        None => Classification {
            pattern: ErrorPattern::Unknown,
            confidence: 0.0,
            details: "no known pattern matched".to_string(),
            raw_match: String::new(),
            severity: Severity::Low,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_wins_tie_against_api_error() {
        let output = "401 Unauthorized\n500 Internal Server Error";
        let c = classify(output);
        assert_eq!(c.pattern.as_str(), "auth_error");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn multiple_hits_boost_confidence() {
        let single = classify("rate limit exceeded");
        let double = classify("rate limit exceeded, 429 too many requests");
        assert!(double.confidence > single.confidence);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let c = classify("everything is fine, have a nice day");
        assert_eq!(c.pattern.as_str(), "unknown");
    }

    #[test]
    fn non_retryable_patterns_report_correctly() {
        assert!(!ErrorPattern::AuthError.is_retryable());
        assert!(!ErrorPattern::ModelError.is_retryable());
        assert!(!ErrorPattern::ContentPolicy.is_retryable());
        assert!(ErrorPattern::RateLimit.is_retryable());
    }
}
