use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::Event;

const RING_BUFFER_CAP: usize = 500;
const DEDUP_WINDOW_MS: i64 = 500;

/// Process-wide typed event bus: a ring buffer of recent events plus a set
/// of subscribers, following the donor's `EventBus` (fan-out over `flume`
/// senders, auto-pruned on disconnect) generalized with a bounded log and
/// publish-time deduplication.
pub struct EventBus {
    inner: Mutex<Inner>,
}

struct Inner {
    subscribers: Vec<flume::Sender<Event>>,
    log: VecDeque<Event>,
    last_emitted: HashMap<(String, String), DateTime<Utc>>,
    last_heartbeat: HashMap<String, DateTime<Utc>>,
}

/// Filter applied to `getEventLog`.
#[derive(Debug, Clone, Default)]
pub struct EventLogFilter {
    pub task_id: Option<String>,
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                log: VecDeque::with_capacity(RING_BUFFER_CAP),
                last_emitted: HashMap::new(),
                last_heartbeat: HashMap::new(),
            }),
        }
    }

    /// Subscribe to future events; the unbounded channel is pruned from the
    /// subscriber list automatically the first time a send fails.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Emit an event, suppressing it if an identical `(type, taskId)` was
    /// emitted within the dedup window (storm suppression).
    pub fn emit(&self, kind: impl Into<String>, task_id: Option<String>, payload: Value) -> bool {
        let kind = kind.into();
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let dedup_key = (kind.clone(), task_id.clone().unwrap_or_default());
        if let Some(last) = inner.last_emitted.get(&dedup_key) {
            if now.signed_duration_since(*last) < chrono::Duration::milliseconds(DEDUP_WINDOW_MS) {
                return false;
            }
        }
        inner.last_emitted.insert(dedup_key, now);

        let event = Event::new(kind, task_id, payload);
        if inner.log.len() >= RING_BUFFER_CAP {
            inner.log.pop_front();
        }
        inner.log.push_back(event.clone());

        inner.subscribers.retain(|s| s.send(event.clone()).is_ok());
        true
    }

    /// Record a heartbeat for `task_id`, used by the staleness sweep.
    pub fn record_heartbeat(&self, task_id: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_heartbeat.insert(task_id.into(), Utc::now());
    }

    /// Sweep heartbeats older than `stale_threshold_ms`, emitting `agent:stale`
    /// and evicting the entry for each one found.
    pub fn sweep_stale_agents(&self, stale_threshold_ms: u64) -> Vec<String> {
        let now = Utc::now();
        let stale: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .last_heartbeat
                .iter()
                .filter(|(_, ts)| {
                    now.signed_duration_since(**ts)
                        > chrono::Duration::milliseconds(stale_threshold_ms as i64)
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for task_id in &stale {
            self.inner.lock().unwrap().last_heartbeat.remove(task_id);
            self.emit(
                "agent:stale",
                Some(task_id.clone()),
                serde_json::json!({ "task_id": task_id }),
            );
        }
        stale
    }

    pub fn get_event_log(&self, filter: &EventLogFilter) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner
            .log
            .iter()
            .filter(|e| filter.task_id.as_deref().is_none_or(|t| e.task_id.as_deref() == Some(t)))
            .filter(|e| filter.kind.as_deref().is_none_or(|k| e.kind == k))
            .filter(|e| filter.since.is_none_or(|s| e.timestamp >= s))
            .cloned()
            .collect()
    }

    pub fn get_error_history(&self, task_id: &str) -> Vec<Event> {
        self.get_event_log(&EventLogFilter {
            task_id: Some(task_id.to_string()),
            kind: Some("task.error".to_string()),
            since: None,
        })
    }

    pub fn get_agent_liveness(&self) -> HashMap<String, DateTime<Utc>> {
        self.inner.lock().unwrap().last_heartbeat.clone()
    }

    pub fn get_error_pattern_summary(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for e in inner.log.iter().filter(|e| e.kind == "task.error") {
            if let Some(pattern) = e.payload.get("pattern").and_then(Value::as_str) {
                *counts.entry(pattern.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_emit() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert!(bus.emit("task.started", Some("T1".into()), serde_json::json!({})));
        let e = rx.try_recv().unwrap();
        assert_eq!(e.kind, "task.started");
    }

    #[test]
    fn dedup_suppresses_storm() {
        let bus = EventBus::new();
        assert!(bus.emit("task.error", Some("T1".into()), serde_json::json!({})));
        assert!(!bus.emit("task.error", Some("T1".into()), serde_json::json!({})));
    }

    #[test]
    fn disconnected_subscriber_pruned() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        bus.emit("x", None, serde_json::json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn stale_sweep_emits_and_evicts() {
        let bus = EventBus::new();
        bus.record_heartbeat("T1");
        // Force the heartbeat into the past by emitting with a zero threshold.
        let stale = bus.sweep_stale_agents(0);
        assert_eq!(stale, vec!["T1".to_string()]);
        assert!(bus.get_agent_liveness().is_empty());
    }

    #[test]
    fn event_log_filters_by_task() {
        let bus = EventBus::new();
        bus.emit("task.started", Some("T1".into()), serde_json::json!({}));
        std::thread::sleep(std::time::Duration::from_millis(1));
        bus.emit("task.started", Some("T2".into()), serde_json::json!({}));
        let filtered = bus.get_event_log(&EventLogFilter {
            task_id: Some("T2".into()),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].task_id.as_deref(), Some("T2"));
    }
}
