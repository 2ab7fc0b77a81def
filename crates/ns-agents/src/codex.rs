//! Codex CLI adapter. Codex session files carry both per-entry token counts
//! and the CLI's own rate-limit snapshots, so usage here is self-reporting
//! rather than budget-relative.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ns_core::config::BudgetMode;
use serde::Deserialize;
use tracing::debug;

use crate::{
    build_file_context, AgentError, AgentProvider, CommandRunner, ExecRunner, ExecuteOptions,
    ExecuteResult, Result, SelfReportingUsage, DEFAULT_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Spawns the `codex` CLI in quiet non-interactive mode.
pub struct CodexAgent {
    binary_path: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    full_auto: bool,
}

impl Default for CodexAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexAgent {
    pub fn new() -> Self {
        Self {
            binary_path: "codex".into(),
            timeout: DEFAULT_TIMEOUT,
            runner: Arc::new(ExecRunner),
            full_auto: false,
        }
    }

    pub fn with_binary_path(mut self, path: impl Into<String>) -> Self {
        self.binary_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pass `--approval-mode full-auto` so the agent works unattended.
    pub fn with_full_auto(mut self, enabled: bool) -> Self {
        self.full_auto = enabled;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }
}

#[async_trait]
impl AgentProvider for CodexAgent {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn binary(&self) -> &str {
        &self.binary_path
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<ExecuteResult> {
        let start = Instant::now();
        let timeout = opts.timeout.unwrap_or(self.timeout);

        let mut args = Vec::new();
        if self.full_auto {
            args.push("--approval-mode".to_string());
            args.push("full-auto".to_string());
        }
        args.push("-q".to_string());
        args.push(opts.prompt.clone());

        let stdin = if opts.files.is_empty() {
            String::new()
        } else {
            build_file_context(&opts.files)?
        };

        let run = tokio::time::timeout(
            timeout,
            self.runner.run(&self.binary_path, &args, &opts.work_dir, &stdin),
        )
        .await
        .map_err(|_| AgentError::Timeout(timeout))?
        .map_err(|e| AgentError::Spawn {
            program: self.binary_path.clone(),
            message: e.to_string(),
        })?;

        debug!(exit_code = run.exit_code, "codex run finished");

        Ok(ExecuteResult {
            stdout: run.stdout,
            stderr: run.stderr,
            exit_code: run.exit_code,
            duration: start.elapsed(),
            json: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// One line of a Codex session file. Only the fields we read are declared;
/// everything else is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct CodexSessionEntry {
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimits {
    /// Short (5h) window.
    #[serde(default)]
    pub primary: Option<RateLimitWindow>,
    /// Weekly window.
    #[serde(default)]
    pub secondary: Option<RateLimitWindow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitWindow {
    #[serde(default)]
    pub used_percent: f64,
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
}

/// Reads Codex session files under `~/.codex/sessions/YYYY/MM/DD/*.jsonl`.
pub struct CodexUsage {
    data_path: PathBuf,
}

impl Default for CodexUsage {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_path: home.join(".codex"),
        }
    }
}

impl CodexUsage {
    pub fn with_path(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    /// All session files, sorted by path (dates sort chronologically).
    pub fn list_session_files(&self) -> Result<Vec<PathBuf>> {
        let sessions = self.data_path.join("sessions");
        if !sessions.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for year in read_dirs(&sessions)? {
            for month in read_dirs(&year)? {
                for day in read_dirs(&month)? {
                    for entry in std::fs::read_dir(&day)? {
                        let path = entry?.path();
                        if path.extension().is_some_and(|e| e == "jsonl") {
                            files.push(path);
                        }
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn token_totals(&self) -> Result<(i64, i64)> {
        let now = Utc::now();
        let today = now.date_naive();
        let week_start = today - chrono::Duration::days(6);

        let mut weekly = 0;
        let mut daily = 0;
        for path in self.list_session_files()? {
            let Some(date) = session_date(&path) else {
                continue;
            };
            if date < week_start || date > today {
                continue;
            }
            let tokens = session_tokens(&path)?;
            weekly += tokens;
            if date == today {
                daily += tokens;
            }
        }
        Ok((weekly, daily))
    }

    /// Latest rate-limit snapshot, read from the newest session file that
    /// contains one.
    fn latest_rate_limits(&self) -> Result<Option<RateLimits>> {
        for path in self.list_session_files()?.into_iter().rev() {
            let text = std::fs::read_to_string(&path)?;
            let mut latest = None;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(entry) = serde_json::from_str::<CodexSessionEntry>(line) else {
                    continue;
                };
                if entry.rate_limits.is_some() {
                    latest = entry.rate_limits;
                }
            }
            if latest.is_some() {
                return Ok(latest);
            }
        }
        Ok(None)
    }
}

impl SelfReportingUsage for CodexUsage {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn used_percent(&self, mode: BudgetMode) -> Result<f64> {
        let Some(limits) = self.latest_rate_limits()? else {
            return Ok(0.0);
        };
        let window = match mode {
            BudgetMode::Daily => limits.primary,
            BudgetMode::Weekly => limits.secondary,
        };
        Ok(window.map(|w| w.used_percent).unwrap_or(0.0))
    }

    fn reset_time(&self, mode: BudgetMode) -> Result<Option<DateTime<Utc>>> {
        let Some(limits) = self.latest_rate_limits()? else {
            return Ok(None);
        };
        let window = match mode {
            BudgetMode::Daily => limits.primary,
            BudgetMode::Weekly => limits.secondary,
        };
        Ok(window.and_then(|w| w.resets_at))
    }

    fn weekly_tokens(&self) -> Result<i64> {
        Ok(self.token_totals()?.0)
    }

    fn today_tokens(&self) -> Result<i64> {
        Ok(self.token_totals()?.1)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Parse the session date out of a `sessions/YYYY/MM/DD/...` path.
fn session_date(path: &Path) -> Option<NaiveDate> {
    let parts: Vec<&str> = path
        .iter()
        .filter_map(|c| c.to_str())
        .collect();
    let idx = parts.iter().position(|p| *p == "sessions")?;
    let year: i32 = parts.get(idx + 1)?.parse().ok()?;
    let month: u32 = parts.get(idx + 2)?.parse().ok()?;
    let day: u32 = parts.get(idx + 3)?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn session_tokens(path: &Path) -> Result<i64> {
    let text = std::fs::read_to_string(path)?;
    let mut total = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<CodexSessionEntry>(line) else {
            continue;
        };
        if let Some(tokens) = entry.token_count {
            total += tokens;
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn session_dir(root: &Path, date: NaiveDate) -> PathBuf {
        let dir = root
            .join("sessions")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn session_date_parses_path_components() {
        let date = session_date(Path::new("/home/me/.codex/sessions/2026/08/01/rollout.jsonl"));
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 8, 1));
        assert!(session_date(Path::new("/home/me/.codex/other/file.jsonl")).is_none());
    }

    #[test]
    fn token_totals_split_weekly_and_daily() {
        let tmp = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();

        let dir = session_dir(tmp.path(), today);
        std::fs::write(
            dir.join("a.jsonl"),
            "{\"token_count\": 1000}\n{\"token_count\": 500}\nnot-json\n",
        )
        .unwrap();

        let old_dir = session_dir(tmp.path(), today - chrono::Duration::days(3));
        std::fs::write(old_dir.join("b.jsonl"), "{\"token_count\": 200}\n").unwrap();

        let stale_dir = session_dir(tmp.path(), today - chrono::Duration::days(10));
        std::fs::write(stale_dir.join("c.jsonl"), "{\"token_count\": 9999}\n").unwrap();

        let usage = CodexUsage::with_path(tmp.path());
        assert_eq!(usage.weekly_tokens().unwrap(), 1700);
        assert_eq!(usage.today_tokens().unwrap(), 1500);
    }

    #[test]
    fn rate_limits_come_from_newest_session() {
        let tmp = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();

        let old_dir = session_dir(tmp.path(), today - chrono::Duration::days(1));
        std::fs::write(
            old_dir.join("old.jsonl"),
            "{\"rate_limits\":{\"secondary\":{\"used_percent\":10.0}}}\n",
        )
        .unwrap();

        let dir = session_dir(tmp.path(), today);
        std::fs::write(
            dir.join("new.jsonl"),
            concat!(
                "{\"rate_limits\":{\"primary\":{\"used_percent\":20.0},",
                "\"secondary\":{\"used_percent\":55.0,\"resets_at\":\"2026-08-09T00:00:00Z\"}}}\n",
            ),
        )
        .unwrap();

        let usage = CodexUsage::with_path(tmp.path());
        assert_eq!(usage.used_percent(BudgetMode::Weekly).unwrap(), 55.0);
        assert_eq!(usage.used_percent(BudgetMode::Daily).unwrap(), 20.0);
        let reset = usage.reset_time(BudgetMode::Weekly).unwrap().unwrap();
        assert_eq!(reset.to_rfc3339(), "2026-08-09T00:00:00+00:00");
    }

    #[test]
    fn no_sessions_reads_as_zero() {
        let usage = CodexUsage::with_path("/nonexistent/nightshift-test");
        assert_eq!(usage.weekly_tokens().unwrap(), 0);
        assert_eq!(usage.used_percent(BudgetMode::Weekly).unwrap(), 0.0);
        assert!(usage.reset_time(BudgetMode::Weekly).unwrap().is_none());
    }
}
