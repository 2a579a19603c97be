//! Alert cooldown tracking. The alerts log is the authoritative store — on
//! startup the map is hydrated by replaying up to
//! `ALERT_COOLDOWN_REPLAY_MAX_BYTES` of it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

pub const DEFAULT_COOLDOWN_MS: i64 = 5 * 60 * 1000;
pub const FAILED_SESSION_HIGH_ERRORS_COOLDOWN_MS: i64 = 60 * 60 * 1000;
pub const PRUNE_INTERVAL_MS: i64 = 10 * 60 * 1000;

fn cooldown_ms_for(alert_type: &str) -> i64 {
    if alert_type == "failed_session_high_errors" {
        FAILED_SESSION_HIGH_ERRORS_COOLDOWN_MS
    } else {
        DEFAULT_COOLDOWN_MS
    }
}

/// Task-scoped alert types key on `(type, taskId)`; everything else keys on
/// `(type, attemptId)`.
pub fn is_task_scoped(alert_type: &str) -> bool {
    matches!(alert_type, "failed_session_high_errors" | "stuck_agent")
}

#[derive(Default)]
pub struct CooldownMap {
    last_emitted: HashMap<(String, String), DateTime<Utc>>,
    last_pruned: Option<DateTime<Utc>>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `now` if emitting is allowed (no entry, or
    /// the cooldown for this `(type, scope)` has elapsed).
    pub fn try_emit(&mut self, alert_type: &str, scope_id: &str, now: DateTime<Utc>) -> bool {
        let key = (alert_type.to_string(), scope_id.to_string());
        let cooldown = chrono::Duration::milliseconds(cooldown_ms_for(alert_type));

        if let Some(last) = self.last_emitted.get(&key) {
            if now.signed_duration_since(*last) < cooldown {
                return false;
            }
        }
        self.last_emitted.insert(key, now);
        true
    }

    /// Hydrate a single historical alert record. Call while replaying the
    /// alerts log up to `ALERT_COOLDOWN_REPLAY_MAX_BYTES` at startup.
    pub fn hydrate(&mut self, alert_type: &str, scope_id: &str, timestamp: DateTime<Utc>) {
        let key = (alert_type.to_string(), scope_id.to_string());
        self.last_emitted
            .entry(key)
            .and_modify(|existing| {
                if timestamp > *existing {
                    *existing = timestamp;
                }
            })
            .or_insert(timestamp);
    }

    /// Drop entries whose cooldown has long since elapsed, bounding memory.
    /// Call at most every `PRUNE_INTERVAL_MS`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_pruned {
            if now.signed_duration_since(last) < chrono::Duration::milliseconds(PRUNE_INTERVAL_MS) {
                return;
            }
        }
        self.last_emitted.retain(|(alert_type, _), last| {
            now.signed_duration_since(*last) < chrono::Duration::milliseconds(cooldown_ms_for(alert_type))
        });
        self.last_pruned = Some(now);
    }
}
