use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.bosun/config.toml`, then
/// overridden by the environment variables listed in the external
/// interfaces (each config field below names the variable it maps to).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub trust_gate: TrustGateConfig,
    #[serde(default)]
    pub kanban: KanbanConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load config from `~/.bosun/config.toml`, falling back to defaults
    /// when the file does not exist or fails to parse, then apply any
    /// recognised environment-variable overrides.
    pub fn load() -> Self {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, path = %path.display(), "failed to parse config, using defaults");
                    Config::default()
                }),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to read config, using defaults");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bosun")
            .join("config.toml")
    }

    /// Apply the environment-variable overrides documented in the external
    /// interfaces section. Invalid values are ignored with a warning rather
    /// than failing startup.
    fn apply_env_overrides(&mut self) {
        env_u32(&mut self.analyzer.error_loop_threshold, "AGENT_ERROR_LOOP_THRESHOLD");
        env_u32(&mut self.analyzer.tool_loop_threshold, "AGENT_TOOL_LOOP_THRESHOLD");
        env_u64(&mut self.analyzer.stuck_threshold_ms, "AGENT_STUCK_THRESHOLD_MS");
        env_u64(&mut self.analyzer.stuck_sweep_interval_ms, "AGENT_STUCK_SWEEP_INTERVAL_MS");
        env_u64_opt(&mut self.analyzer.initial_replay_max_session_age_ms, "AGENT_INITIAL_REPLAY_MAX_SESSION_AGE_MS");
        env_u64(&mut self.analyzer.alert_cooldown_replay_max_bytes, "AGENT_ALERT_COOLDOWN_REPLAY_MAX_BYTES");
        env_f64(&mut self.analyzer.cost_anomaly_threshold_usd, "AGENT_COST_ANOMALY_THRESHOLD");
        env_bool(&mut self.analyzer.replay_startup, "AGENT_ANALYZER_REPLAY_STARTUP");

        if let Some(v) = std::env::var("VK_MAX_PARALLEL")
            .ok()
            .or_else(|| std::env::var("MAX_PARALLEL").ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.scheduler.max_parallel = v;
        }
        if let Ok(v) = std::env::var("BOSUN_WORKSPACE") {
            self.persistence.workspace_root = Some(v);
        }
        if let Ok(v) = std::env::var("REPO_ROOT").or_else(|_| std::env::var("BOSUN_AGENT_REPO_ROOT")) {
            self.scheduler.repo_root = Some(v);
        }
        env_bool(&mut self.trust_gate.ingestion_enabled, "BOSUN_ISSUE_INGESTION");
    }
}

fn env_u32(field: &mut u32, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(n) => *field = n,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}

fn env_u64(field: &mut u64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(n) => *field = n,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}

fn env_u64_opt(field: &mut Option<u64>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(n) => *field = Some(n),
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}

fn env_f64(field: &mut f64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(n) => *field = n,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}

fn env_bool(field: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => *field = true,
            "0" | "false" | "no" => *field = false,
            _ => tracing::warn!(key, value = %v, "ignoring unparsable bool env override"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default)]
    pub base_branch_limit: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_base_branch")]
    pub default_target_branch: String,
    #[serde(default)]
    pub repo_root: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            base_branch_limit: 0,
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            default_target_branch: default_base_branch(),
            repo_root: None,
        }
    }
}

fn default_max_parallel() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    30_000
}
fn default_task_timeout_ms() -> u64 {
    6 * 60 * 60 * 1000
}
fn default_base_branch() -> String {
    "origin/main".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

fn default_ttl_minutes() -> i64 {
    180
}
fn default_renew_interval_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_error_loop_threshold")]
    pub error_loop_threshold: u32,
    #[serde(default = "default_tool_loop_threshold")]
    pub tool_loop_threshold: u32,
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,
    #[serde(default = "default_stuck_sweep_interval_ms")]
    pub stuck_sweep_interval_ms: u64,
    #[serde(default)]
    pub initial_replay_max_session_age_ms: Option<u64>,
    #[serde(default = "default_alert_cooldown_replay_max_bytes")]
    pub alert_cooldown_replay_max_bytes: u64,
    #[serde(default = "default_cost_anomaly_threshold_usd")]
    pub cost_anomaly_threshold_usd: f64,
    #[serde(default)]
    pub replay_startup: bool,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            error_loop_threshold: default_error_loop_threshold(),
            tool_loop_threshold: default_tool_loop_threshold(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
            stuck_sweep_interval_ms: default_stuck_sweep_interval_ms(),
            initial_replay_max_session_age_ms: None,
            alert_cooldown_replay_max_bytes: default_alert_cooldown_replay_max_bytes(),
            cost_anomaly_threshold_usd: default_cost_anomaly_threshold_usd(),
            replay_startup: false,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl AnalyzerConfig {
    /// `max(3x stuck threshold, 15 min)`, used when no explicit override is set.
    pub fn initial_replay_max_session_age_ms(&self) -> u64 {
        self.initial_replay_max_session_age_ms
            .unwrap_or_else(|| (self.stuck_threshold_ms * 3).max(15 * 60 * 1000))
    }
}

fn default_error_loop_threshold() -> u32 {
    4
}
fn default_tool_loop_threshold() -> u32 {
    10
}
fn default_stuck_threshold_ms() -> u64 {
    300_000
}
fn default_stuck_sweep_interval_ms() -> u64 {
    30_000
}
fn default_alert_cooldown_replay_max_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_cost_anomaly_threshold_usd() -> f64 {
    1.0
}
fn default_heartbeat_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    #[serde(default = "default_rate_limit_hit_threshold")]
    pub rate_limit_hit_threshold: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            rate_limit_hit_threshold: default_rate_limit_hit_threshold(),
        }
    }
}

fn default_max_consecutive_errors() -> u32 {
    5
}
fn default_rate_limit_cooldown_ms() -> u64 {
    60_000
}
fn default_rate_limit_hit_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustGateConfig {
    #[serde(default)]
    pub ingestion_enabled: bool,
    #[serde(default = "default_true")]
    pub require_trusted_creator: bool,
    #[serde(default)]
    pub trusted_users: Vec<String>,
    #[serde(default)]
    pub extra_injection_patterns: Vec<String>,
    #[serde(default = "default_new_external_task_status")]
    pub new_external_task_status: String,
    #[serde(default = "default_true")]
    pub post_rejection_comment: bool,
}

impl Default for TrustGateConfig {
    fn default() -> Self {
        Self {
            ingestion_enabled: false,
            require_trusted_creator: true,
            trusted_users: Vec::new(),
            extra_injection_patterns: Vec::new(),
            new_external_task_status: default_new_external_task_status(),
            post_rejection_comment: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_new_external_task_status() -> String {
    "backlog".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KanbanConfig {
    #[serde(default = "default_kanban_backend")]
    pub backend: String,
    #[serde(default)]
    pub github_owner: Option<String>,
    #[serde(default)]
    pub github_repo: Option<String>,
}

fn default_kanban_backend() -> String {
    "local".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_cache_root")]
    pub cache_root: String,
    #[serde(default = "default_state_root")]
    pub state_root: String,
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            state_root: default_state_root(),
            workspace_root: None,
        }
    }
}

fn default_cache_root() -> String {
    "~/.bosun/cache".into()
}
fn default_state_root() -> String {
    "~/.bosun/state".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scheduler.max_parallel, 3);
        assert_eq!(parsed.analyzer.error_loop_threshold, 4);
    }

    #[test]
    fn env_override_max_parallel() {
        std::env::set_var("MAX_PARALLEL", "7");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.scheduler.max_parallel, 7);
        std::env::remove_var("MAX_PARALLEL");
    }

    #[test]
    fn initial_replay_defaults_to_derived_value() {
        let cfg = AnalyzerConfig::default();
        assert_eq!(cfg.initial_replay_max_session_age_ms(), 900_000);
    }
}
