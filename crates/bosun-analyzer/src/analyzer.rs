//! Wires the tailer, per-session detectors, and cooldown map into a runnable
//! work-stream analyzer: tail the log, feed each event through the
//! detectors, gate alerts through cooldown, and append survivors to the
//! alerts log + event bus. Mirrors the donor's `FileWatcher` + handler-map
//! pattern generalized to a fixed detector set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bosun_core::config::AnalyzerConfig;
use bosun_core::event_bus::EventBus;
use bosun_core::types::WorkStreamEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cooldown::{is_task_scoped, CooldownMap};
use crate::detectors::{Alert, DetectorState};
use crate::tailer::{LogTailer, StartPosition, TailerError};

const BATCH_SIZE: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Tailer(#[from] TailerError),
    #[error("alerts log write failed: {0}")]
    AlertLog(std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Severity assigned per alert type, following the classifier's own
/// high/critical-first convention (stuck and cost alerts are operator-paging
/// events; loops are informational).
fn severity_for(alert_type: &str) -> &'static str {
    match alert_type {
        "failed_session_high_errors" | "stuck_agent" => "high",
        "cost_anomaly" => "medium",
        "excessive_restarts" => "medium",
        _ => "low",
    }
}

fn recommendation_for(alert_type: &str) -> &'static str {
    match alert_type {
        "error_loop" => "the agent is repeating the same failing action; consider blocking and escalating",
        "tool_loop" => "the agent is repeating the same tool call; a targeted prompt may unstick it",
        "excessive_restarts" => "this task has been restarted repeatedly; inspect the task for a structural blocker",
        "cost_anomaly" => "this session's cost exceeds the configured threshold; review the transcript",
        "failed_session_high_errors" => "this task failed with a high error count; likely needs manual intervention",
        "stuck_agent" => "no activity observed past the stuck threshold; the agent may be hung",
        _ => "review the work-stream log for this session",
    }
}

/// One line of the alerts log, per the documented format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub timestamp: DateTime<Utc>,
    pub attempt_id: Option<Uuid>,
    pub task_id: Option<String>,
    pub executor: Option<String>,
    pub severity: String,
    pub recommendation: String,
    #[serde(rename = "_cooldown_key")]
    pub cooldown_key: String,
    #[serde(flatten)]
    pub details: serde_json::Value,
}

impl AlertRecord {
    fn from_alert(alert: &Alert, cooldown_key: &str) -> Self {
        Self {
            alert_type: alert.alert_type.clone(),
            timestamp: Utc::now(),
            attempt_id: Some(alert.attempt_id),
            task_id: alert.task_id.clone(),
            executor: None,
            severity: severity_for(&alert.alert_type).to_string(),
            recommendation: recommendation_for(&alert.alert_type).to_string(),
            cooldown_key: cooldown_key.to_string(),
            details: alert.details.clone(),
        }
    }
}

/// Runs the work-stream analyzer: one `LogTailer` over the agent's
/// append-only work-stream log, a `DetectorState` of rolling per-session
/// state, and a `CooldownMap` gating alert emission. Alerts that survive
/// cooldown are appended to the alerts log and published on the event bus.
pub struct Analyzer {
    tailer: LogTailer,
    detectors: DetectorState,
    cooldowns: CooldownMap,
    alerts_log_path: PathBuf,
    event_bus: Arc<EventBus>,
    config: AnalyzerConfig,
    last_stuck_sweep: Option<DateTime<Utc>>,
    last_idle_sweep: Option<DateTime<Utc>>,
}

impl Analyzer {
    pub fn open(work_stream_path: &Path, alerts_log_path: impl Into<PathBuf>, event_bus: Arc<EventBus>, config: AnalyzerConfig) -> Result<Self> {
        let alerts_log_path = alerts_log_path.into();
        let start = if config.replay_startup { StartPosition::Start } else { StartPosition::Eof };
        let tailer = LogTailer::open(work_stream_path, start)?;

        if let Some(parent) = alerts_log_path.parent() {
            std::fs::create_dir_all(parent).map_err(AnalyzerError::AlertLog)?;
        }
        if !alerts_log_path.exists() {
            std::fs::File::create(&alerts_log_path).map_err(AnalyzerError::AlertLog)?;
        }

        let mut cooldowns = CooldownMap::new();
        hydrate_cooldowns(&alerts_log_path, config.alert_cooldown_replay_max_bytes, &mut cooldowns)?;

        let mut detectors = DetectorState::new();
        if config.replay_startup {
            prune_replayed_sessions(&mut detectors, work_stream_path, config.initial_replay_max_session_age_ms())?;
        }

        Ok(Self {
            tailer,
            detectors,
            cooldowns,
            alerts_log_path,
            event_bus,
            config,
            last_stuck_sweep: None,
            last_idle_sweep: None,
        })
    }

    /// Drains whatever new lines are available, bounded to `BATCH_SIZE` per
    /// call and yielding between batches so a burst cannot starve the rest
    /// of the runtime.
    pub async fn drain_available(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let lines = self.tailer.read_new_lines()?;
            if lines.is_empty() {
                break;
            }
            for chunk in lines.chunks(BATCH_SIZE) {
                for line in chunk {
                    let Ok(event) = serde_json::from_str::<WorkStreamEvent>(line) else { continue };
                    let alerts = self.detectors.on_event(&event);
                    self.emit_alerts(alerts)?;
                    total += 1;
                }
                tokio::task::yield_now().await;
            }
        }
        Ok(total)
    }

    /// Timer-driven stuck/idle/cooldown-prune sweep. Call roughly every
    /// `stuckSweepIntervalMs`.
    pub fn sweep(&mut self) -> Result<()> {
        let now = Utc::now();
        if self
            .last_stuck_sweep
            .map(|t| now.signed_duration_since(t) >= chrono::Duration::milliseconds(self.config.stuck_sweep_interval_ms as i64))
            .unwrap_or(true)
        {
            let alerts = self.detectors.sweep_stuck(now);
            self.emit_alerts(alerts)?;
            self.detectors.sweep_idle_sessions(now);
            self.last_stuck_sweep = Some(now);
            self.last_idle_sweep = Some(now);
        }
        self.cooldowns.prune(now);
        Ok(())
    }

    fn emit_alerts(&mut self, alerts: Vec<Alert>) -> Result<()> {
        for alert in alerts {
            let scope_id = if is_task_scoped(&alert.alert_type) {
                alert.task_id.clone().unwrap_or_else(|| alert.attempt_id.to_string())
            } else {
                alert.attempt_id.to_string()
            };
            let cooldown_key = format!("{}:{}", alert.alert_type, scope_id);

            if !self.cooldowns.try_emit(&alert.alert_type, &scope_id, Utc::now()) {
                continue;
            }

            let record = AlertRecord::from_alert(&alert, &cooldown_key);
            append_alert(&self.alerts_log_path, &record)?;
            self.event_bus.emit(
                format!("alert:{}", alert.alert_type),
                alert.task_id.clone(),
                serde_json::to_value(&record).unwrap_or_default(),
            );
        }
        Ok(())
    }
}

fn append_alert(path: &Path, record: &AlertRecord) -> Result<()> {
    use std::io::Write;
    let mut line = serde_json::to_string(record).map_err(|e| AnalyzerError::AlertLog(std::io::Error::other(e)))?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path).map_err(AnalyzerError::AlertLog)?;
    file.write_all(line.as_bytes()).map_err(AnalyzerError::AlertLog)?;
    Ok(())
}

/// Reads up to the last `max_bytes` of the alerts log and reconstructs
/// cooldown entries whose window has not yet elapsed. The alerts log is the
/// authoritative cooldown store, so a restarted analyzer does not re-emit
/// alerts it already emitted moments before going down.
fn hydrate_cooldowns(path: &Path, max_bytes: u64, cooldowns: &mut CooldownMap) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };
    let len = file.metadata().map_err(AnalyzerError::AlertLog)?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).map_err(AnalyzerError::AlertLog)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(AnalyzerError::AlertLog)?;

    for line in buf.lines() {
        let Ok(record) = serde_json::from_str::<AlertRecord>(line) else { continue };
        let scope_id = record.cooldown_key.rsplit_once(':').map(|(_, s)| s.to_string()).unwrap_or_default();
        cooldowns.hydrate(&record.alert_type, &scope_id, record.timestamp);
    }
    Ok(())
}

/// `replayStartup=true` replays the whole work-stream log from offset 0,
/// then immediately prunes sessions whose last activity predates
/// `max_age_ms` so stale replayed sessions cannot trip the stuck sweep.
fn prune_replayed_sessions(detectors: &mut DetectorState, work_stream_path: &Path, max_age_ms: u64) -> Result<()> {
    let Ok(contents) = std::fs::read_to_string(work_stream_path) else { return Ok(()) };
    for line in contents.lines() {
        let Ok(event) = serde_json::from_str::<WorkStreamEvent>(line) else { continue };
        detectors.on_event(&event);
    }
    let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age_ms as i64);
    detectors.sweep_idle_sessions(cutoff);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::types::WorkStreamEventType;
    use std::io::Write as _;

    fn write_event(path: &Path, event: &WorkStreamEvent) {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        writeln!(file, "{}", serde_json::to_string(event).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn drains_new_events_and_writes_alert_on_error_loop() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("ws.jsonl");
        let alerts_path = dir.path().join("alerts.jsonl");
        std::fs::write(&ws_path, "").unwrap();

        let config = AnalyzerConfig { replay_startup: true, ..Default::default() };
        let bus = Arc::new(EventBus::new());
        let mut analyzer = Analyzer::open(&ws_path, &alerts_path, bus, config).unwrap();

        let attempt = Uuid::new_v4();
        for i in 0..4 {
            write_event(
                &ws_path,
                &WorkStreamEvent {
                    attempt_id: attempt,
                    event_type: WorkStreamEventType::Error,
                    timestamp: Utc::now() + chrono::Duration::seconds(i),
                    task_id: Some("T1".into()),
                    executor: Some("claude".into()),
                    data: serde_json::json!({ "error_fingerprint": "boom" }),
                },
            );
        }

        analyzer.drain_available().await.unwrap();

        let alerts = std::fs::read_to_string(&alerts_path).unwrap();
        assert!(alerts.contains("error_loop"));
        assert!(alerts.contains("\"_cooldown_key\""));
    }

    #[tokio::test]
    async fn cooldown_suppresses_duplicate_alert_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("ws.jsonl");
        let alerts_path = dir.path().join("alerts.jsonl");
        std::fs::write(&ws_path, "").unwrap();

        let config = AnalyzerConfig { replay_startup: true, ..Default::default() };
        let bus = Arc::new(EventBus::new());
        let mut analyzer = Analyzer::open(&ws_path, &alerts_path, bus, config).unwrap();

        let attempt = Uuid::new_v4();
        for batch in 0..2 {
            for i in 0..4 {
                write_event(
                    &ws_path,
                    &WorkStreamEvent {
                        attempt_id: attempt,
                        event_type: WorkStreamEventType::Error,
                        timestamp: Utc::now() + chrono::Duration::seconds(batch * 10 + i),
                        task_id: Some("T1".into()),
                        executor: None,
                        data: serde_json::json!({ "error_fingerprint": "boom" }),
                    },
                );
            }
            analyzer.drain_available().await.unwrap();
        }

        let alerts = std::fs::read_to_string(&alerts_path).unwrap();
        assert_eq!(alerts.lines().count(), 1, "second burst should be suppressed by cooldown");
    }

    #[tokio::test]
    async fn hydrates_cooldown_from_existing_alerts_log_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("ws.jsonl");
        let alerts_path = dir.path().join("alerts.jsonl");
        std::fs::write(&ws_path, "").unwrap();

        let prior = AlertRecord {
            alert_type: "error_loop".to_string(),
            timestamp: Utc::now(),
            attempt_id: Some(Uuid::new_v4()),
            task_id: Some("T1".into()),
            executor: None,
            severity: "low".to_string(),
            recommendation: "x".to_string(),
            cooldown_key: "error_loop:some-attempt".to_string(),
            details: serde_json::json!({}),
        };
        std::fs::write(&alerts_path, format!("{}\n", serde_json::to_string(&prior).unwrap())).unwrap();

        let config = AnalyzerConfig { replay_startup: true, ..Default::default() };
        let bus = Arc::new(EventBus::new());
        let mut analyzer = Analyzer::open(&ws_path, &alerts_path, bus, config).unwrap();

        assert!(!analyzer.cooldowns.try_emit("error_loop", "some-attempt", Utc::now()));
    }
}
