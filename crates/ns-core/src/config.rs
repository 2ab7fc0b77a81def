use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.config/nightshift/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist. The loaded config is validated and normalized.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("nightshift")
            .join("config.toml")
    }

    /// Data directory (`~/.local/share/nightshift`). Holds the database and
    /// the legacy state directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("nightshift")
    }

    /// Resolved database path: `budget.db_path` when set, otherwise
    /// `<data_dir>/nightshift.db`.
    pub fn db_path(&self) -> PathBuf {
        match &self.budget.db_path {
            Some(p) if !p.is_empty() => expand_path(p),
            _ => Self::data_dir().join("nightshift.db"),
        }
    }

    /// Weekly token budget for a provider: per-provider override when present,
    /// otherwise the shared `weekly_tokens`.
    pub fn provider_budget(&self, provider: &str) -> i64 {
        self.budget
            .per_provider
            .get(provider)
            .copied()
            .unwrap_or(self.budget.weekly_tokens)
    }

    /// Whether a task type passes the enable/disable lists. An empty enabled
    /// list means all types are enabled; the disabled list always wins.
    pub fn is_task_enabled(&self, task_type: &str) -> bool {
        if self.tasks.disabled.iter().any(|t| t == task_type) {
            return false;
        }
        if self.tasks.enabled.is_empty() {
            return true;
        }
        self.tasks.enabled.iter().any(|t| t == task_type)
    }

    /// Configured priority for a task type (default 0).
    pub fn task_priority(&self, task_type: &str) -> i64 {
        self.tasks.priorities.get(task_type).copied().unwrap_or(0)
    }

    /// Configured cooldown override for a task type, if any.
    pub fn task_interval(&self, task_type: &str) -> Option<Duration> {
        self.tasks
            .intervals
            .get(task_type)
            .and_then(|s| parse_duration(s).ok())
    }

    /// Snapshot ticker interval (default 30 minutes).
    pub fn snapshot_interval(&self) -> Duration {
        parse_duration(&self.budget.snapshot_interval)
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    /// Main-run interval when `schedule.interval` is configured.
    pub fn run_interval(&self) -> Option<Duration> {
        self.schedule
            .interval
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
    }

    /// Enabled providers in preference order.
    pub fn provider_preference(&self) -> Vec<String> {
        self.providers.preference.clone()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "claude" => Some(&self.providers.claude),
            "codex" => Some(&self.providers.codex),
            "gemini" => Some(&self.providers.gemini),
            _ => None,
        }
    }

    /// Validate the full configuration, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.cron.is_some() && self.schedule.interval.is_some() {
            return Err(ConfigError::CronAndInterval);
        }
        if let Some(cron) = &self.schedule.cron {
            if cron.split_whitespace().count() != 5 {
                return Err(ConfigError::InvalidCron(cron.clone()));
            }
        }
        if let Some(interval) = &self.schedule.interval {
            parse_duration(interval)
                .map_err(|_| ConfigError::InvalidDuration("schedule.interval", interval.clone()))?;
        }
        if self.budget.max_percent > 100 {
            return Err(ConfigError::InvalidPercent(
                "budget.max_percent",
                self.budget.max_percent,
            ));
        }
        if self.budget.reserve_percent > 100 {
            return Err(ConfigError::InvalidPercent(
                "budget.reserve_percent",
                self.budget.reserve_percent,
            ));
        }
        parse_duration(&self.budget.snapshot_interval).map_err(|_| {
            ConfigError::InvalidDuration(
                "budget.snapshot_interval",
                self.budget.snapshot_interval.clone(),
            )
        })?;
        for (task, interval) in &self.tasks.intervals {
            parse_duration(interval).map_err(|_| {
                ConfigError::InvalidDuration("tasks.intervals", format!("{task}={interval}"))
            })?;
        }
        validate_custom_tasks(&self.tasks.custom)?;
        Ok(())
    }

    /// Normalize derived settings: API billing has a known budget, so
    /// calibration is forced off.
    fn normalize(&mut self) {
        if self.budget.billing_mode == BillingMode::Api {
            self.budget.calibrate_enabled = false;
        }
    }
}

fn validate_custom_tasks(customs: &[CustomTaskConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for c in customs {
        if !is_kebab_case(&c.task_type) {
            return Err(ConfigError::InvalidCustomTask(format!(
                "type {:?} is not kebab-case",
                c.task_type
            )));
        }
        if c.name.trim().is_empty() {
            return Err(ConfigError::InvalidCustomTask(format!(
                "custom task {:?} has an empty name",
                c.task_type
            )));
        }
        if c.description.trim().is_empty() {
            return Err(ConfigError::InvalidCustomTask(format!(
                "custom task {:?} has an empty description",
                c.task_type
            )));
        }
        if let Some(interval) = &c.interval {
            parse_duration(interval).map_err(|_| {
                ConfigError::InvalidDuration("tasks.custom.interval", interval.clone())
            })?;
        }
        if !seen.insert(c.task_type.clone()) {
            return Err(ConfigError::InvalidCustomTask(format!(
                "duplicate custom task type {:?}",
                c.task_type
            )));
        }
    }
    Ok(())
}

pub fn is_kebab_case(s: &str) -> bool {
    !s.is_empty()
        && s.split('-').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("schedule: cron and interval are mutually exclusive")]
    CronAndInterval,
    #[error("schedule: invalid cron expression {0:?} (expected 5 fields)")]
    InvalidCron(String),
    #[error("{0}: {1} is outside 0..=100")]
    InvalidPercent(&'static str, u32),
    #[error("{0}: invalid duration {1:?}")]
    InvalidDuration(&'static str, String),
    #[error("custom task: {0}")]
    InvalidCustomTask(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub window: Option<WindowConfig>,
}

/// Optional run window; runs outside it are skipped by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub mode: BudgetMode,
    #[serde(default = "default_max_percent")]
    pub max_percent: u32,
    #[serde(default = "default_reserve_percent")]
    pub reserve_percent: u32,
    #[serde(default)]
    pub billing_mode: BillingMode,
    #[serde(default = "default_true")]
    pub calibrate_enabled: bool,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: String,
    #[serde(default = "default_weekly_tokens")]
    pub weekly_tokens: i64,
    #[serde(default)]
    pub week_start_day: WeekStartDay,
    #[serde(default)]
    pub aggressive_end_of_week: bool,
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Per-provider weekly-token overrides.
    #[serde(default)]
    pub per_provider: HashMap<String, i64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            mode: BudgetMode::default(),
            max_percent: default_max_percent(),
            reserve_percent: default_reserve_percent(),
            billing_mode: BillingMode::default(),
            calibrate_enabled: true,
            snapshot_interval: default_snapshot_interval(),
            weekly_tokens: default_weekly_tokens(),
            per_provider: HashMap::new(),
            week_start_day: WeekStartDay::default(),
            aggressive_end_of_week: false,
            db_path: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_max_percent() -> u32 {
    50
}
fn default_reserve_percent() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_snapshot_interval() -> String {
    "30m".into()
}
fn default_weekly_tokens() -> i64 {
    500_000
}
fn default_retention_days() -> i64 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_preference")]
    pub preference: Vec<String>,
    #[serde(default = "ProviderConfig::enabled_by_default")]
    pub claude: ProviderConfig,
    #[serde(default)]
    pub codex: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            preference: default_preference(),
            claude: ProviderConfig::enabled_by_default(),
            codex: ProviderConfig::default(),
            gemini: ProviderConfig::default(),
        }
    }
}

fn default_preference() -> Vec<String> {
    vec!["claude".into(), "codex".into(), "gemini".into()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub data_path: Option<String>,
    /// Pass the provider's skip-confirmation flag to the agent CLI.
    #[serde(default, alias = "dangerously_skip_permissions")]
    pub yolo: bool,
}

impl ProviderConfig {
    fn enabled_by_default() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Expanded data path, if configured.
    pub fn expanded_data_path(&self) -> Option<PathBuf> {
        self.data_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(expand_path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default)]
    pub priorities: HashMap<String, i64>,
    #[serde(default)]
    pub intervals: HashMap<String, String>,
    #[serde(default)]
    pub custom: Vec<CustomTaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTaskConfig {
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub cost_tier: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    #[default]
    Daily,
    Weekly,
}

impl BudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetMode::Daily => "daily",
            BudgetMode::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingMode {
    #[default]
    Subscription,
    Api,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStartDay {
    Sunday,
    #[default]
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl WeekStartDay {
    pub fn to_weekday(self) -> chrono::Weekday {
        match self {
            WeekStartDay::Sunday => chrono::Weekday::Sun,
            WeekStartDay::Monday => chrono::Weekday::Mon,
            WeekStartDay::Tuesday => chrono::Weekday::Tue,
            WeekStartDay::Wednesday => chrono::Weekday::Wed,
            WeekStartDay::Thursday => chrono::Weekday::Thu,
            WeekStartDay::Friday => chrono::Weekday::Fri,
            WeekStartDay::Saturday => chrono::Weekday::Sat,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~/` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse a duration string of the form `"90s"`, `"30m"`, `"24h"`, `"7d"`, or
/// a compound like `"1h30m"`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidDuration("duration", s.into()));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut saw_unit = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let value: u64 = num
            .parse()
            .map_err(|_| ConfigError::InvalidDuration("duration", s.into()))?;
        num.clear();
        saw_unit = true;
        let secs = match c {
            's' => value,
            'm' => value * 60,
            'h' => value * 3600,
            'd' => value * 86_400,
            _ => return Err(ConfigError::InvalidDuration("duration", s.into())),
        };
        total += Duration::from_secs(secs);
    }
    if !num.is_empty() || !saw_unit {
        return Err(ConfigError::InvalidDuration("duration", s.into()));
    }
    Ok(total)
}
