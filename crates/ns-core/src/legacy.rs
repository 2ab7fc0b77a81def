//! Shape of the legacy JSON state file imported once on first open.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Root of `state/state.json` as written by pre-database versions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyState {
    #[serde(default)]
    pub projects: HashMap<String, LegacyProject>,
    /// project path -> task type -> last run.
    #[serde(default)]
    pub task_runs: HashMap<String, HashMap<String, DateTime<Utc>>>,
    #[serde(default)]
    pub assigned_tasks: HashMap<String, LegacyAssignment>,
    #[serde(default)]
    pub run_history: Vec<LegacyRun>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyProject {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyAssignment {
    pub project: String,
    pub task_type: String,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRun {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub project: String,
    #[serde(default)]
    pub tasks: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}
