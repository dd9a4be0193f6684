//! Supervisor configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::AutonomyLevel;

/// Main supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Think-loop and policy knobs
    pub ai: AiConfig,

    /// Notification tiers and budget
    pub notifications: NotificationConfig,

    /// Window in which tiers 2/3 are suppressed
    #[serde(rename = "quiet-hours")]
    pub quiet_hours: QuietHoursConfig,

    /// Revenue subsystem
    pub revenue: RevenueConfig,

    /// Trust accrual and promotion thresholds
    pub trust: TrustConfig,

    /// Evening digest cron job
    #[serde(rename = "evening-digest")]
    pub evening_digest: CronJobConfig,

    /// Morning digest cron job
    #[serde(rename = "morning-digest")]
    pub morning_digest: CronJobConfig,

    /// Weekly revenue report cron job
    #[serde(rename = "weekly-revenue")]
    pub weekly_revenue: CronJobConfig,

    /// Reminder subsystem
    pub reminders: RemindersConfig,

    /// Session-learner gating
    pub learning: LearningConfig,

    /// Operator focus/skip/block lists fed into the context prompt
    pub priorities: PrioritiesConfig,

    /// Storage paths
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// An explicit path that fails to load is the one fatal boot condition.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".orchd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("orchd").join("orchd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse the configured timezone, falling back to UTC with a warning
    pub fn timezone(&self) -> chrono_tz::Tz {
        let name = &self.quiet_hours.timezone;
        name.parse().unwrap_or_else(|_| {
            tracing::warn!(timezone = %name, "Unknown timezone, falling back to UTC");
            chrono_tz::UTC
        })
    }
}

/// Think-loop, policy, and session knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// If false the think loop is inert (scan still runs)
    pub enabled: bool,

    /// Model identifier for think cycles
    pub model: String,

    /// Model identifier for session evaluations
    #[serde(rename = "eval-model")]
    pub eval_model: String,

    /// Print-mode LLM CLI binary
    pub command: String,

    /// Default gap between think cycles
    #[serde(rename = "think-interval-ms")]
    pub think_interval_ms: u64,

    /// Think-cycle LLM timeout
    #[serde(rename = "think-timeout-ms")]
    pub think_timeout_ms: u64,

    /// Evaluation LLM timeout
    #[serde(rename = "eval-timeout-ms")]
    pub eval_timeout_ms: u64,

    /// Prompt truncation ceiling in characters
    #[serde(rename = "max-prompt-length")]
    pub max_prompt_length: usize,

    /// Boot default; overridden by the persisted runtime level
    #[serde(rename = "autonomy-level")]
    pub autonomy_level: AutonomyLevel,

    /// Projects for which all executions are blocked
    #[serde(rename = "protected-projects")]
    pub protected_projects: Vec<String>,

    /// Cooldown windows
    pub cooldowns: CooldownConfig,

    /// Resource preconditions
    #[serde(rename = "resource-limits")]
    pub resource_limits: ResourceLimitsConfig,

    /// Retry cap per project for failed starts
    #[serde(rename = "max-error-retries")]
    pub max_error_retries: u32,

    /// Timeout ceiling for a session
    #[serde(rename = "max-session-duration-ms")]
    pub max_session_duration_ms: u64,

    /// Concurrent session cap
    #[serde(rename = "max-concurrent-sessions")]
    pub max_concurrent_sessions: usize,

    /// Days idle before a project is marked STALE in context
    #[serde(rename = "staleness-days")]
    pub staleness_days: i64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-sonnet-4-20250514".to_string(),
            eval_model: "claude-3-5-haiku-20241022".to_string(),
            command: "claude".to_string(),
            think_interval_ms: 300_000,
            think_timeout_ms: 60_000,
            eval_timeout_ms: 30_000,
            max_prompt_length: 8_000,
            autonomy_level: AutonomyLevel::Observe,
            protected_projects: Vec::new(),
            cooldowns: CooldownConfig::default(),
            resource_limits: ResourceLimitsConfig::default(),
            max_error_retries: 3,
            max_session_duration_ms: 45 * 60 * 1000,
            max_concurrent_sessions: 3,
            staleness_days: 7,
        }
    }
}

/// Minimum inter-action gaps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    #[serde(rename = "same-project-ms")]
    pub same_project_ms: u64,

    #[serde(rename = "same-action-ms")]
    pub same_action_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            same_project_ms: 10 * 60 * 1000,
            same_action_ms: 5 * 60 * 1000,
        }
    }
}

/// Skip thresholds for think and start preconditions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    #[serde(rename = "min-free-memory-mb")]
    pub min_free_memory_mb: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self { min_free_memory_mb: 512 }
    }
}

/// Notification budget and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Tier-2 send count per local day
    #[serde(rename = "daily-budget")]
    pub daily_budget: u32,

    /// Tier-3 flush cadence
    #[serde(rename = "batch-interval-ms")]
    pub batch_interval_ms: u64,

    /// In-memory dedup window
    #[serde(rename = "dedup-ttl-ms")]
    pub dedup_ttl_ms: u64,

    /// Outbound SMS command (argv; message appended as the last argument).
    /// Empty means log-only.
    #[serde(rename = "send-command")]
    pub send_command: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            daily_budget: 20,
            batch_interval_ms: 30 * 60 * 1000,
            dedup_ttl_ms: 60 * 60 * 1000,
            send_command: Vec::new(),
        }
    }
}

/// Quiet-hours window in the configured timezone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    /// "HH:MM" local start
    pub start: String,

    /// "HH:MM" local end
    pub end: String,

    /// IANA timezone name; also used for the budget day boundary and cron
    pub timezone: String,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            start: "22:30".to_string(),
            end: "07:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Revenue subsystem knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevenueConfig {
    pub enabled: bool,

    /// Collect every Nth scan tick
    #[serde(rename = "collection-interval-scans")]
    pub collection_interval_scans: u64,

    /// Snapshot retention window in days
    #[serde(rename = "retention-days")]
    pub retention_days: i64,
}

impl Default for RevenueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_scans: 5,
            retention_days: 90,
        }
    }
}

/// One promotion threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionThreshold {
    #[serde(rename = "min-sessions")]
    pub min_sessions: u64,

    #[serde(rename = "min-avg-score")]
    pub min_avg_score: f64,

    #[serde(rename = "min-days")]
    pub min_days: f64,
}

impl Default for PromotionThreshold {
    fn default() -> Self {
        Self {
            min_sessions: 30,
            min_avg_score: 3.5,
            min_days: 7.0,
        }
    }
}

/// Trust accrual and promotion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub enabled: bool,

    #[serde(rename = "cautious-to-moderate")]
    pub cautious_to_moderate: PromotionThreshold,

    #[serde(rename = "moderate-to-full")]
    pub moderate_to_full: PromotionThreshold,

    /// Cron expression for the daily promotion check
    #[serde(rename = "promotion-check-cron")]
    pub promotion_check_cron: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cautious_to_moderate: PromotionThreshold::default(),
            moderate_to_full: PromotionThreshold {
                min_sessions: 50,
                min_avg_score: 4.0,
                min_days: 14.0,
            },
            promotion_check_cron: "0 0 10 * * *".to_string(),
        }
    }
}

/// A toggleable cron job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJobConfig {
    pub enabled: bool,
    pub cron: String,
}

impl Default for CronJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: String::new(),
        }
    }
}

impl Config {
    /// Morning digest schedule (default 07:00 daily)
    pub fn morning_cron(&self) -> String {
        if self.morning_digest.cron.is_empty() {
            "0 0 7 * * *".to_string()
        } else {
            self.morning_digest.cron.clone()
        }
    }

    /// Evening digest schedule (default 21:45 daily)
    pub fn evening_cron(&self) -> String {
        if self.evening_digest.cron.is_empty() {
            "0 45 21 * * *".to_string()
        } else {
            self.evening_digest.cron.clone()
        }
    }

    /// Weekly revenue schedule (default Sunday 07:00)
    pub fn weekly_revenue_cron(&self) -> String {
        if self.weekly_revenue.cron.is_empty() {
            "0 0 7 * * Sun".to_string()
        } else {
            self.weekly_revenue.cron.clone()
        }
    }
}

/// Reminder subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemindersConfig {
    pub enabled: bool,
    pub timezone: String,
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "UTC".to_string(),
        }
    }
}

/// Session-learner gate and cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Minimum evaluation rows before patterns are reported
    #[serde(rename = "min-evaluations")]
    pub min_evaluations: u64,

    /// Re-analyze every N new rows
    #[serde(rename = "analysis-interval")]
    pub analysis_interval: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_evaluations: 50,
            analysis_interval: 10,
        }
    }
}

/// Operator-supplied project priorities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritiesConfig {
    /// Projects listed first in context
    pub focus: Vec<String>,

    /// Projects excluded from context
    pub skip: Vec<String>,

    /// Projects the LLM must never act on (merged with protected-projects)
    pub block: Vec<String>,

    /// Free-form operator notes surfaced in the prompt
    pub notes: String,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory scanned for projects
    #[serde(rename = "projects-root")]
    pub projects_root: PathBuf,

    /// State document path (empty = data dir default)
    #[serde(rename = "state-file")]
    pub state_file: PathBuf,

    /// Embedded database path (empty = data dir default)
    #[serde(rename = "database-file")]
    pub database_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            projects_root: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("projects"),
            state_file: PathBuf::new(),
            database_file: PathBuf::new(),
        }
    }
}

impl StorageConfig {
    fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orchd")
    }

    /// Resolved state document path
    pub fn state_path(&self) -> PathBuf {
        if self.state_file.as_os_str().is_empty() {
            Self::data_dir().join("state.json")
        } else {
            self.state_file.clone()
        }
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        if self.database_file.as_os_str().is_empty() {
            Self::data_dir().join("orchestrator.db")
        } else {
            self.database_file.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.ai.enabled);
        assert_eq!(config.ai.autonomy_level, AutonomyLevel::Observe);
        assert_eq!(config.ai.max_error_retries, 3);
        assert_eq!(config.ai.cooldowns.same_project_ms, 600_000);
        assert_eq!(config.notifications.daily_budget, 20);
        assert_eq!(config.revenue.retention_days, 90);
        assert_eq!(config.trust.moderate_to_full.min_sessions, 50);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
ai:
  enabled: true
  model: claude-opus-4
  autonomy-level: cautious
  protected-projects:
    - billing
  max-error-retries: 5
  cooldowns:
    same-project-ms: 300000

notifications:
  daily-budget: 10

quiet-hours:
  start: "23:00"
  end: "06:30"
  timezone: America/Los_Angeles

trust:
  cautious-to-moderate:
    min-sessions: 2
    min-avg-score: 3.0
    min-days: 0
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.ai.model, "claude-opus-4");
        assert_eq!(config.ai.autonomy_level, AutonomyLevel::Cautious);
        assert_eq!(config.ai.protected_projects, vec!["billing".to_string()]);
        assert_eq!(config.ai.max_error_retries, 5);
        assert_eq!(config.ai.cooldowns.same_project_ms, 300_000);
        // Unspecified fields fall back to defaults
        assert_eq!(config.ai.cooldowns.same_action_ms, 300_000);
        assert_eq!(config.notifications.daily_budget, 10);
        assert_eq!(config.quiet_hours.timezone, "America/Los_Angeles");
        assert_eq!(config.trust.cautious_to_moderate.min_sessions, 2);
        // Nested defaults survive partial override
        assert_eq!(config.trust.moderate_to_full.min_avg_score, 4.0);
    }

    #[test]
    fn test_timezone_fallback() {
        let mut config = Config::default();
        config.quiet_hours.timezone = "Not/AZone".to_string();
        assert_eq!(config.timezone(), chrono_tz::UTC);

        config.quiet_hours.timezone = "Europe/Berlin".to_string();
        assert_eq!(config.timezone(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_cron_defaults() {
        let config = Config::default();
        assert_eq!(config.morning_cron(), "0 0 7 * * *");
        assert_eq!(config.evening_cron(), "0 45 21 * * *");
        assert_eq!(config.weekly_revenue_cron(), "0 0 7 * * Sun");
    }
}
