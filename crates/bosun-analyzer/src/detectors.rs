//! Per-session rolling state and the work-stream detectors that read it.

use std::collections::HashMap;

use bosun_core::types::{WorkStreamEvent, WorkStreamEventType};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const ERROR_LOOP_THRESHOLD: usize = 4;
pub const TOOL_LOOP_THRESHOLD: usize = 10;
pub const RESTART_ALERT_THRESHOLD: u32 = 3;
pub const COST_ANOMALY_THRESHOLD_USD: f64 = 1.0;
pub const STUCK_DETECTION_THRESHOLD_MS: i64 = 5 * 60 * 1000;

const ERROR_LOOP_WINDOW_MS: i64 = 10 * 60 * 1000;
const TOOL_LOOP_WINDOW_MS: i64 = 60 * 1000;
const SESSION_IDLE_EVICT_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct Alert {
    pub alert_type: String,
    pub task_id: Option<String>,
    pub attempt_id: Uuid,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct SessionState {
    task_id: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    error_fingerprints: Vec<(String, DateTime<Utc>)>,
    tool_calls: Vec<(String, DateTime<Utc>)>,
    restart_count: u32,
    session_error_count: usize,
}

#[derive(Default)]
pub struct DetectorState {
    sessions: HashMap<Uuid, SessionState>,
}

impl DetectorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one work-stream event through the per-session detectors.
    /// Returns any alerts raised by this event (cooldown gating happens in
    /// the caller via `cooldown::CooldownMap`).
    pub fn on_event(&mut self, event: &WorkStreamEvent) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let state = self.sessions.entry(event.attempt_id).or_default();
        state.task_id = event.task_id.clone().or_else(|| state.task_id.clone());
        state.last_activity = Some(event.timestamp);

        match event.event_type {
            WorkStreamEventType::Error => {
                let fingerprint = event
                    .data
                    .get("error_fingerprint")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                state.session_error_count += 1;
                state.error_fingerprints.push((fingerprint.clone(), event.timestamp));
                state.error_fingerprints.retain(|(_, ts)| {
                    event.timestamp.signed_duration_since(*ts) <= chrono::Duration::milliseconds(ERROR_LOOP_WINDOW_MS)
                });
                let recurrence = state.error_fingerprints.iter().filter(|(f, _)| *f == fingerprint).count();
                if recurrence >= ERROR_LOOP_THRESHOLD {
                    alerts.push(Alert {
                        alert_type: "error_loop".to_string(),
                        task_id: state.task_id.clone(),
                        attempt_id: event.attempt_id,
                        details: serde_json::json!({ "error_fingerprint": fingerprint, "occurrences": recurrence }),
                    });
                }
            }
            WorkStreamEventType::ToolCall => {
                let tool_name = event.data.get("tool_name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                state.tool_calls.push((tool_name.clone(), event.timestamp));
                state.tool_calls.retain(|(_, ts)| {
                    event.timestamp.signed_duration_since(*ts) <= chrono::Duration::milliseconds(TOOL_LOOP_WINDOW_MS)
                });
                let recurrence = state.tool_calls.iter().filter(|(t, _)| *t == tool_name).count();
                if recurrence >= TOOL_LOOP_THRESHOLD {
                    alerts.push(Alert {
                        alert_type: "tool_loop".to_string(),
                        task_id: state.task_id.clone(),
                        attempt_id: event.attempt_id,
                        details: serde_json::json!({ "tool_name": tool_name, "occurrences": recurrence, "window_ms": TOOL_LOOP_WINDOW_MS }),
                    });
                }
            }
            WorkStreamEventType::SessionStart => {
                let prompt_type = event.data.get("prompt_type").and_then(|v| v.as_str()).unwrap_or_default();
                if matches!(prompt_type, "followup" | "retry") {
                    state.restart_count += 1;
                    if state.restart_count >= RESTART_ALERT_THRESHOLD {
                        alerts.push(Alert {
                            alert_type: "excessive_restarts".to_string(),
                            task_id: state.task_id.clone(),
                            attempt_id: event.attempt_id,
                            details: serde_json::json!({ "occurrences": state.restart_count }),
                        });
                    }
                }
            }
            WorkStreamEventType::SessionEnd => {
                if let Some(cost) = event.data.get("cost_usd").and_then(|v| v.as_f64()) {
                    if cost > COST_ANOMALY_THRESHOLD_USD {
                        alerts.push(Alert {
                            alert_type: "cost_anomaly".to_string(),
                            task_id: state.task_id.clone(),
                            attempt_id: event.attempt_id,
                            details: serde_json::json!({ "cost_usd": cost }),
                        });
                    }
                }
                let completion_status = event.data.get("completion_status").and_then(|v| v.as_str()).unwrap_or_default();
                if completion_status == "failed" && state.session_error_count >= ERROR_LOOP_THRESHOLD {
                    alerts.push(Alert {
                        alert_type: "failed_session_high_errors".to_string(),
                        task_id: state.task_id.clone(),
                        attempt_id: event.attempt_id,
                        details: serde_json::json!({ "error_count": state.session_error_count }),
                    });
                }
            }
            WorkStreamEventType::Heartbeat => {}
        }

        alerts
    }

    /// Timer-driven stuck-agent sweep. Never triggered from event handling,
    /// so log replay alone cannot produce a false positive.
    pub fn sweep_stuck(&self, now: DateTime<Utc>) -> Vec<Alert> {
        self.sessions
            .iter()
            .filter_map(|(attempt_id, state)| {
                let last = state.last_activity?;
                let idle_ms = now.signed_duration_since(last).num_milliseconds();
                if idle_ms > STUCK_DETECTION_THRESHOLD_MS {
                    Some(Alert {
                        alert_type: "stuck_agent".to_string(),
                        task_id: state.task_id.clone(),
                        attempt_id: *attempt_id,
                        details: serde_json::json!({ "idle_time_ms": idle_ms, "threshold_ms": STUCK_DETECTION_THRESHOLD_MS }),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Evict sessions idle for more than an hour.
    pub fn sweep_idle_sessions(&mut self, now: DateTime<Utc>) {
        self.sessions.retain(|_, state| {
            state
                .last_activity
                .map(|last| now.signed_duration_since(last) <= chrono::Duration::milliseconds(SESSION_IDLE_EVICT_MS))
                .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(attempt_id: Uuid, fingerprint: &str, ts: DateTime<Utc>) -> WorkStreamEvent {
        WorkStreamEvent {
            attempt_id,
            event_type: WorkStreamEventType::Error,
            timestamp: ts,
            task_id: Some("T1".into()),
            executor: None,
            data: serde_json::json!({ "error_fingerprint": fingerprint }),
        }
    }

    #[test]
    fn error_loop_at_fourth_identical_fingerprint_boundary() {
        let mut state = DetectorState::new();
        let attempt = Uuid::new_v4();
        let t0 = Utc::now();
        for i in 0..3 {
            let alerts = state.on_event(&error_event(attempt, "ERR-X", t0 + chrono::Duration::seconds(i)));
            assert!(alerts.is_empty(), "should not alert before 4th occurrence");
        }
        let alerts = state.on_event(&error_event(attempt, "ERR-X", t0 + chrono::Duration::seconds(3)));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "error_loop");
    }

    #[test]
    fn tool_loop_at_exactly_ten_within_window() {
        let mut state = DetectorState::new();
        let attempt = Uuid::new_v4();
        let t0 = Utc::now();
        let mut last_alerts = Vec::new();
        for i in 0..10 {
            let event = WorkStreamEvent {
                attempt_id: attempt,
                event_type: WorkStreamEventType::ToolCall,
                timestamp: t0 + chrono::Duration::seconds(i),
                task_id: Some("T1".into()),
                executor: None,
                data: serde_json::json!({ "tool_name": "bash" }),
            };
            last_alerts = state.on_event(&event);
        }
        assert_eq!(last_alerts.len(), 1);
        assert_eq!(last_alerts[0].alert_type, "tool_loop");
    }

    #[test]
    fn cost_anomaly_strictly_greater_than_threshold() {
        let mut state = DetectorState::new();
        let attempt = Uuid::new_v4();
        let at_threshold = WorkStreamEvent {
            attempt_id: attempt,
            event_type: WorkStreamEventType::SessionEnd,
            timestamp: Utc::now(),
            task_id: Some("T1".into()),
            executor: None,
            data: serde_json::json!({ "completion_status": "success", "cost_usd": 1.0 }),
        };
        assert!(state.on_event(&at_threshold).is_empty());

        let over_threshold = WorkStreamEvent {
            data: serde_json::json!({ "completion_status": "success", "cost_usd": 1.01 }),
            ..at_threshold
        };
        let alerts = state.on_event(&over_threshold);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "cost_anomaly");
    }

    #[test]
    fn stuck_sweep_strictly_greater_than_threshold() {
        let mut state = DetectorState::new();
        let attempt = Uuid::new_v4();
        let t0 = Utc::now();
        state.on_event(&error_event(attempt, "x", t0));

        let at_threshold = state.sweep_stuck(t0 + chrono::Duration::milliseconds(STUCK_DETECTION_THRESHOLD_MS));
        assert!(at_threshold.is_empty());

        let over_threshold = state.sweep_stuck(t0 + chrono::Duration::milliseconds(STUCK_DETECTION_THRESHOLD_MS + 1));
        assert_eq!(over_threshold.len(), 1);
    }

    #[test]
    fn stuck_sweep_never_triggered_by_event_handling_alone() {
        let mut state = DetectorState::new();
        let attempt = Uuid::new_v4();
        let alerts = state.on_event(&error_event(attempt, "x", Utc::now()));
        assert!(alerts.iter().all(|a| a.alert_type != "stuck_agent"));
    }
}
