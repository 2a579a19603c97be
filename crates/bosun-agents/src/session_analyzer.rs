//! Session-sequence analyzer: looks at the ordered messages of a single
//! session and flags behavioral patterns (stuck plans, false completion
//! claims, loops) so the recovery policy can intervene mid-session.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    ToolCall,
    AgentMessage,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub kind: MessageKind,
    pub content: String,
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPattern {
    RateLimited,
    PlanStuck,
    FalseCompletion,
    CommitsNoPush,
    PermissionWait,
    ErrorLoop,
    NeedsClarification,
    ToolLoop,
    AnalysisParalysis,
    NoProgress,
}

impl SessionPattern {
    pub fn as_str(&self) -> &'static str {
        use SessionPattern::*;
        match self {
            RateLimited => "rate_limited",
            PlanStuck => "plan_stuck",
            FalseCompletion => "false_completion",
            CommitsNoPush => "commits_no_push",
            PermissionWait => "permission_wait",
            ErrorLoop => "error_loop",
            NeedsClarification => "needs_clarification",
            ToolLoop => "tool_loop",
            AnalysisParalysis => "analysis_paralysis",
            NoProgress => "no_progress",
        }
    }

    /// Targeted intervention prompt for this pattern.
    pub fn intervention_prompt(&self) -> &'static str {
        use SessionPattern::*;
        match self {
            RateLimited => "Pause and wait before retrying; the provider is rate-limiting this session.",
            PlanStuck => "Stop planning and begin implementing the change now.",
            FalseCompletion => "Verify the work was actually committed and pushed before declaring completion.",
            CommitsNoPush => "Push the committed branch before reporting completion.",
            PermissionWait => "Proceed with the previously described plan without waiting for further confirmation.",
            ErrorLoop => "Stop repeating the same failing action; diagnose the root cause first.",
            NeedsClarification => "State your best assumption and proceed rather than waiting for clarification.",
            ToolLoop => "Stop repeating the same tool calls; try a different approach.",
            AnalysisParalysis => "Stop reading and begin making the necessary edits.",
            NoProgress => "Take a concrete action rather than continuing to describe the plan.",
        }
    }
}

const PRIORITY: &[SessionPattern] = &[
    SessionPattern::RateLimited,
    SessionPattern::PlanStuck,
    SessionPattern::FalseCompletion,
    SessionPattern::CommitsNoPush,
    SessionPattern::PermissionWait,
    SessionPattern::ErrorLoop,
    SessionPattern::NeedsClarification,
    SessionPattern::ToolLoop,
    SessionPattern::AnalysisParalysis,
    SessionPattern::NoProgress,
];

const READ_LIKE: &[&str] = &["read", "search", "grep", "list", "find", "cat"];
const WRITE_LIKE: &[&str] = &["write", "edit", "create", "replace", "patch", "append"];

fn regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static CELL: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    CELL.get_or_init(|| {
        (
            Regex::new(r"(?i)here's the plan|plan\.md|ready to begin|would you like me to implement").unwrap(),
            Regex::new(r"(?i)need clarification|which approach|please specify").unwrap(),
            Regex::new(r"(?i)task complete|pushed to|pr created").unwrap(),
            Regex::new(r"(?i)should i proceed|waiting for your").unwrap(),
            Regex::new(r"(?i)rate.?limit").unwrap(),
        )
    })
}

#[derive(Debug, Clone)]
pub struct SessionAnalysis {
    pub patterns: Vec<SessionPattern>,
    pub primary: Option<SessionPattern>,
    pub details: String,
}

pub fn analyze(messages: &[SessionMessage]) -> SessionAnalysis {
    let (plan_re, clarify_re, complete_re, permission_re, rate_re) = regexes();

    let tool_calls: Vec<&SessionMessage> = messages.iter().filter(|m| m.kind == MessageKind::ToolCall).collect();
    let agent_messages: Vec<&SessionMessage> = messages.iter().filter(|m| m.kind == MessageKind::AgentMessage).collect();
    let errors: Vec<&SessionMessage> = messages.iter().filter(|m| m.kind == MessageKind::Error).collect();

    let agent_text: String = agent_messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");

    let has_commit = tool_calls.iter().any(|m| m.content.contains("git commit"));
    let has_push = tool_calls.iter().any(|m| m.content.contains("git push"));

    let mut patterns = Vec::new();

    if errors.iter().filter(|m| rate_re.is_match(&m.content)).count() >= 2 {
        patterns.push(SessionPattern::RateLimited);
    }

    let write_like_count = tool_calls
        .iter()
        .filter(|m| m.tool_name.as_deref().map(|n| WRITE_LIKE.iter().any(|w| n.contains(w))).unwrap_or(false))
        .count();

    if plan_re.is_match(&agent_text) && write_like_count <= 1 {
        patterns.push(SessionPattern::PlanStuck);
    }

    if complete_re.is_match(&agent_text) && !has_commit && !has_push {
        patterns.push(SessionPattern::FalseCompletion);
    }

    if has_commit && !has_push && complete_re.is_match(&agent_text) {
        patterns.push(SessionPattern::CommitsNoPush);
    }

    if let Some(last) = agent_messages.last() {
        if permission_re.is_match(&last.content) {
            patterns.push(SessionPattern::PermissionWait);
        }
    }

    if errors.len() >= 3 {
        let tail: Vec<String> = errors.iter().rev().take(3).map(|m| truncate(&m.content, 100)).collect();
        if tail.iter().all(|c| c == &tail[0]) {
            patterns.push(SessionPattern::ErrorLoop);
        }
    }

    if clarify_re.is_match(&agent_text) {
        patterns.push(SessionPattern::NeedsClarification);
    }

    if tool_calls.len() >= 5 {
        let last_five: Vec<&str> = tool_calls.iter().rev().take(5).filter_map(|m| m.tool_name.as_deref()).collect();
        let distinct: std::collections::HashSet<&str> = last_five.iter().copied().collect();
        if distinct.len() <= 2 {
            patterns.push(SessionPattern::ToolLoop);
        }
    }

    if tool_calls.len() >= 10 {
        let read_like_count = tool_calls
            .iter()
            .filter(|m| m.tool_name.as_deref().map(|n| READ_LIKE.iter().any(|r| n.contains(r))).unwrap_or(false))
            .count();
        if read_like_count >= 8 && write_like_count == 0 {
            patterns.push(SessionPattern::AnalysisParalysis);
        }
    }

    if messages.len() >= 5 && tool_calls.is_empty() && agent_messages.len() <= 1 {
        patterns.push(SessionPattern::NoProgress);
    }

    let primary = PRIORITY.iter().find(|p| patterns.contains(p)).copied();
    let details = primary.map(|p| p.as_str().to_string()).unwrap_or_else(|| "no pattern detected".to_string());

    SessionAnalysis { patterns, primary, details }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, content: &str) -> SessionMessage {
        SessionMessage { kind: MessageKind::ToolCall, content: content.to_string(), tool_name: Some(name.to_string()) }
    }

    fn agent(content: &str) -> SessionMessage {
        SessionMessage { kind: MessageKind::AgentMessage, content: content.to_string(), tool_name: None }
    }

    fn error(content: &str) -> SessionMessage {
        SessionMessage { kind: MessageKind::Error, content: content.to_string(), tool_name: None }
    }

    #[test]
    fn detects_false_completion_without_push() {
        let messages = vec![agent("task complete, all done")];
        let analysis = analyze(&messages);
        assert_eq!(analysis.primary, Some(SessionPattern::FalseCompletion));
    }

    #[test]
    fn detects_commits_no_push() {
        let messages = vec![tool("bash", "git commit -m done"), agent("task complete")];
        let analysis = analyze(&messages);
        assert!(analysis.patterns.contains(&SessionPattern::CommitsNoPush));
    }

    #[test]
    fn detects_tool_loop_on_repeated_tool() {
        let messages: Vec<_> = (0..6).map(|_| tool("read_file", "reading again")).collect();
        let analysis = analyze(&messages);
        assert!(analysis.patterns.contains(&SessionPattern::ToolLoop));
    }

    #[test]
    fn detects_analysis_paralysis() {
        let mut messages: Vec<_> = (0..9).map(|_| tool("read_file", "reading")).collect();
        messages.push(tool("grep", "searching"));
        let analysis = analyze(&messages);
        assert!(analysis.patterns.contains(&SessionPattern::AnalysisParalysis));
    }

    #[test]
    fn detects_error_loop_on_identical_tail() {
        let messages = vec![error("boom"), error("boom"), error("boom")];
        let analysis = analyze(&messages);
        assert_eq!(analysis.primary, Some(SessionPattern::ErrorLoop));
    }

    #[test]
    fn no_progress_with_few_messages_and_no_tools() {
        let messages = vec![error("e1"), error("e2"), error("e3"), error("e4"), agent("stalled")];
        let analysis = analyze(&messages);
        assert!(analysis.patterns.contains(&SessionPattern::NoProgress));
    }
}
