//! Claude CLI adapter: headless execution plus local session usage read-off.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ns_core::config::BudgetMode;
use tracing::debug;

use crate::{
    build_file_context, start_of_today, sum_jsonl_tokens, AgentError, AgentProvider,
    BudgetRelativeUsage, CommandRunner, ExecRunner, ExecuteOptions, ExecuteResult, Result,
    DEFAULT_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Spawns the `claude` CLI in non-interactive mode (`-p <prompt>`).
pub struct ClaudeAgent {
    binary_path: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    skip_permissions: bool,
}

impl Default for ClaudeAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeAgent {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".into(),
            timeout: DEFAULT_TIMEOUT,
            runner: Arc::new(ExecRunner),
            skip_permissions: false,
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

    /// Pass `--dangerously-skip-permissions` so the agent runs unattended.
    pub fn with_skip_permissions(mut self, enabled: bool) -> Self {
        self.skip_permissions = enabled;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }
}

#[async_trait]
impl AgentProvider for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn binary(&self) -> &str {
        &self.binary_path
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<ExecuteResult> {
        let start = Instant::now();
        let timeout = opts.timeout.unwrap_or(self.timeout);

        let mut args = vec!["-p".to_string(), opts.prompt.clone()];
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".into());
        }
        args.push("--output-format".into());
        args.push("text".into());

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

        debug!(exit_code = run.exit_code, "claude run finished");

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

/// Reads token usage from Claude's local session files
/// (`~/.claude/projects/<slug>/<session>.jsonl`). Each assistant entry
/// carries a `message.usage` block and an RFC 3339 `timestamp`.
pub struct ClaudeUsage {
    data_path: PathBuf,
}

impl Default for ClaudeUsage {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_path: home.join(".claude"),
        }
    }
}

impl ClaudeUsage {
    pub fn with_path(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    fn tokens_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
        let projects = self.data_path.join("projects");
        if !projects.is_dir() {
            return Ok(0);
        }

        let mut total = 0;
        for project in std::fs::read_dir(&projects)? {
            let project = project?.path();
            if !project.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&project)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "jsonl") {
                    let text = std::fs::read_to_string(&path)?;
                    total += sum_jsonl_tokens(&text, from, to, extract_usage);
                }
            }
        }
        Ok(total)
    }
}

/// Pull `(timestamp, total tokens)` out of one session entry. Entries
/// without a usage block (user turns, summaries) yield nothing.
fn extract_usage(value: &serde_json::Value) -> Option<(DateTime<Utc>, i64)> {
    let ts = value.get("timestamp")?.as_str()?;
    let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let usage = value.get("message")?.get("usage")?;
    let fields = [
        "input_tokens",
        "output_tokens",
        "cache_creation_input_tokens",
        "cache_read_input_tokens",
    ];
    let tokens: i64 = fields
        .iter()
        .filter_map(|f| usage.get(f).and_then(|v| v.as_i64()))
        .sum();
    Some((ts, tokens))
}

impl BudgetRelativeUsage for ClaudeUsage {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn used_percent(&self, mode: BudgetMode, weekly_budget: i64) -> Result<f64> {
        if weekly_budget <= 0 {
            return Ok(0.0);
        }
        match mode {
            BudgetMode::Daily => {
                let daily_budget = weekly_budget / 7;
                if daily_budget <= 0 {
                    return Ok(0.0);
                }
                Ok(self.today_tokens()? as f64 / daily_budget as f64 * 100.0)
            }
            BudgetMode::Weekly => {
                Ok(self.weekly_tokens()? as f64 / weekly_budget as f64 * 100.0)
            }
        }
    }

    fn weekly_tokens(&self) -> Result<i64> {
        let now = Utc::now();
        self.tokens_between(now - chrono::Duration::days(7), now)
    }

    fn today_tokens(&self) -> Result<i64> {
        self.tokens_between(start_of_today(), Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunOutput;
    use std::path::Path;
    use std::sync::Mutex;

    struct CapturingRunner {
        calls: Mutex<Vec<(String, Vec<String>, String)>>,
        output: RunOutput,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CommandRunner for CapturingRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _work_dir: &Path,
            stdin: &str,
        ) -> std::io::Result<RunOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec(), stdin.to_string()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn execute_builds_headless_args() {
        let runner = Arc::new(CapturingRunner {
            calls: Mutex::new(Vec::new()),
            output: RunOutput {
                stdout: "done".into(),
                stderr: String::new(),
                exit_code: 0,
            },
            delay: None,
        });
        let agent = ClaudeAgent::new()
            .with_skip_permissions(true)
            .with_runner(runner.clone());

        let result = agent
            .execute(ExecuteOptions {
                prompt: "fix the lints".into(),
                work_dir: PathBuf::from("/tmp"),
                files: vec![],
                timeout: None,
            })
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.stdout, "done");

        let calls = runner.calls.lock().unwrap();
        let (program, args, stdin) = &calls[0];
        assert_eq!(program, "claude");
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "fix the lints");
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(stdin.is_empty());
    }

    #[tokio::test]
    async fn execute_times_out() {
        let runner = Arc::new(CapturingRunner {
            calls: Mutex::new(Vec::new()),
            output: RunOutput::default(),
            delay: Some(Duration::from_secs(5)),
        });
        let agent = ClaudeAgent::new().with_runner(runner);

        let err = agent
            .execute(ExecuteOptions {
                prompt: "slow".into(),
                work_dir: PathBuf::from("/tmp"),
                files: vec![],
                timeout: Some(Duration::from_millis(20)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    fn write_session(dir: &Path, name: &str, entries: &[(&str, i64)]) {
        let mut text = String::new();
        for (ts, tokens) in entries {
            text.push_str(&format!(
                "{{\"timestamp\":\"{ts}\",\"message\":{{\"usage\":{{\"input_tokens\":{tokens},\"output_tokens\":0}}}}}}\n"
            ));
        }
        // lines without usage are skipped
        text.push_str("{\"type\":\"summary\"}\n");
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn usage_sums_recent_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("projects").join("-home-me-proj");
        std::fs::create_dir_all(&proj).unwrap();

        let now = Utc::now();
        let today = now.to_rfc3339();
        let three_days_ago = (now - chrono::Duration::days(3)).to_rfc3339();
        let last_month = (now - chrono::Duration::days(30)).to_rfc3339();
        write_session(
            &proj,
            "a.jsonl",
            &[(&today, 1000), (&three_days_ago, 500), (&last_month, 9999)],
        );

        let usage = ClaudeUsage::with_path(tmp.path());
        assert_eq!(usage.weekly_tokens().unwrap(), 1500);
        assert_eq!(usage.today_tokens().unwrap(), 1000);
    }

    #[test]
    fn used_percent_daily_and_weekly() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("projects").join("p");
        std::fs::create_dir_all(&proj).unwrap();
        let today = Utc::now().to_rfc3339();
        write_session(&proj, "a.jsonl", &[(&today, 50_000)]);

        let usage = ClaudeUsage::with_path(tmp.path());
        // daily budget = 700k/7 = 100k -> 50% used today
        let daily = usage.used_percent(BudgetMode::Daily, 700_000).unwrap();
        assert!((daily - 50.0).abs() < 0.01);
        // weekly: 50k of 700k
        let weekly = usage.used_percent(BudgetMode::Weekly, 700_000).unwrap();
        assert!((weekly - 7.14).abs() < 0.05);
    }

    #[test]
    fn missing_data_dir_reads_as_zero() {
        let usage = ClaudeUsage::with_path("/nonexistent/nightshift-test");
        assert_eq!(usage.weekly_tokens().unwrap(), 0);
        assert_eq!(usage.used_percent(BudgetMode::Daily, 700_000).unwrap(), 0.0);
    }
}
