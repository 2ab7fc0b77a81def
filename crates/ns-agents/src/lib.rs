//! Agent provider capabilities: execution adapters for the Claude, Codex,
//! and Gemini CLIs plus local usage read-off.
//!
//! Usage is deliberately not one interface. Claude and Gemini report usage
//! relative to a weekly budget; Codex reports its own windowed percentages
//! and reset times. The two capabilities are kept as separate traits and
//! combined in [`UsageProbe`], a tagged set whose arms carry exactly the
//! parameters they need.

pub mod claude;
pub mod codex;
pub mod gemini;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ns_core::config::BudgetMode;
use tokio::io::AsyncWriteExt;

/// Default per-invocation agent timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage data: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Execution capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub work_dir: PathBuf,
    /// Extra files whose contents are fed to the agent as context.
    pub files: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    /// Structured payload when the agent emitted parseable JSON.
    pub json: Option<serde_json::Value>,
}

impl ExecuteResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// The orchestrator's view of an agent CLI.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Binary the adapter spawns; used for PATH checks.
    fn binary(&self) -> &str;

    fn available(&self) -> bool {
        ns_core::exec::binary_on_path(self.binary()).is_some()
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<ExecuteResult>;
}

// ---------------------------------------------------------------------------
// Usage capabilities
// ---------------------------------------------------------------------------

/// Usage read-off for providers whose percentages are computed against a
/// configured weekly budget (Claude, Gemini).
pub trait BudgetRelativeUsage: Send + Sync {
    fn name(&self) -> &'static str;
    fn used_percent(&self, mode: BudgetMode, weekly_budget: i64) -> Result<f64>;
    /// Locally counted tokens over the trailing week.
    fn weekly_tokens(&self) -> Result<i64>;
    /// Locally counted tokens today.
    fn today_tokens(&self) -> Result<i64>;
}

/// Usage read-off for providers that report their own windowed percentages
/// and reset times (Codex).
pub trait SelfReportingUsage: Send + Sync {
    fn name(&self) -> &'static str;
    fn used_percent(&self, mode: BudgetMode) -> Result<f64>;
    fn reset_time(&self, mode: BudgetMode) -> Result<Option<DateTime<Utc>>>;
    fn weekly_tokens(&self) -> Result<i64>;
    fn today_tokens(&self) -> Result<i64>;
}

/// Tagged usage capability for one provider.
#[derive(Clone)]
pub enum UsageProbe {
    BudgetRelative(Arc<dyn BudgetRelativeUsage>),
    SelfReporting(Arc<dyn SelfReportingUsage>),
}

impl UsageProbe {
    pub fn provider(&self) -> &'static str {
        match self {
            UsageProbe::BudgetRelative(u) => u.name(),
            UsageProbe::SelfReporting(u) => u.name(),
        }
    }

    pub fn weekly_tokens(&self) -> Result<i64> {
        match self {
            UsageProbe::BudgetRelative(u) => u.weekly_tokens(),
            UsageProbe::SelfReporting(u) => u.weekly_tokens(),
        }
    }

    pub fn today_tokens(&self) -> Result<i64> {
        match self {
            UsageProbe::BudgetRelative(u) => u.today_tokens(),
            UsageProbe::SelfReporting(u) => u.today_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Executes the agent binary. Production uses [`ExecRunner`]; tests inject
/// fakes to script outputs and inspect arguments.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        work_dir: &Path,
        stdin: &str,
    ) -> std::io::Result<RunOutput>;
}

pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        work_dir: &Path,
        stdin: &str,
    ) -> std::io::Result<RunOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !work_dir.as_os_str().is_empty() {
            cmd.current_dir(work_dir);
        }
        if !stdin.is_empty() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        if !stdin.is_empty() {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(stdin.as_bytes()).await?;
                // Close stdin so the agent sees EOF.
                drop(pipe);
            }
        }

        let output = child.wait_with_output().await?;
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Render context files as a markdown block fed to the agent over stdin.
pub(crate) fn build_file_context(files: &[PathBuf]) -> Result<String> {
    use std::fmt::Write;

    let mut out = String::from("# Context Files\n\n");
    for path in files {
        let content = std::fs::read_to_string(path)?;
        let display = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone());
        let _ = write!(
            out,
            "## File: {}\n\n```\n{}\n```\n\n",
            display.display(),
            content
        );
    }
    Ok(out)
}

/// Sum the tokens reported in a provider's JSONL session files that fall
/// inside `[from, to]`, using `extract` to pull `(timestamp, tokens)` from
/// each parsed line. Unparseable lines are skipped.
pub(crate) fn sum_jsonl_tokens(
    text: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    extract: impl Fn(&serde_json::Value) -> Option<(DateTime<Utc>, i64)>,
) -> i64 {
    let mut total = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if let Some((ts, tokens)) = extract(&value) {
            if ts >= from && ts <= to {
                total += tokens;
            }
        }
    }
    total
}

/// Midnight today in UTC.
pub(crate) fn start_of_today() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sum_jsonl_tokens_filters_by_window() {
        let text = r#"
            {"ts": "2026-07-30T01:00:00Z", "tokens": 100}
            {"ts": "2026-07-20T01:00:00Z", "tokens": 999}
            not json
            {"ts": "2026-07-31T01:00:00Z", "tokens": 50}
        "#;
        let from = Utc.with_ymd_and_hms(2026, 7, 29, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let total = sum_jsonl_tokens(text, from, to, |v| {
            let ts = v.get("ts")?.as_str()?;
            let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            Some((ts, v.get("tokens")?.as_i64()?))
        });
        assert_eq!(total, 150);
    }

    #[test]
    fn file_context_includes_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("notes.md");
        std::fs::write(&file, "remember the reserve").unwrap();

        let ctx = build_file_context(&[file]).unwrap();
        assert!(ctx.starts_with("# Context Files"));
        assert!(ctx.contains("remember the reserve"));
        assert!(ctx.contains("notes.md"));
    }
}
