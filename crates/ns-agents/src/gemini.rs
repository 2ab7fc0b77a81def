//! Gemini CLI adapter. Gemini's session files carry no parseable token
//! totals yet, so local counts read as zero and calibration snapshots fill
//! the gap over time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ns_core::config::BudgetMode;
use tracing::debug;

use crate::{
    build_file_context, AgentError, AgentProvider, BudgetRelativeUsage, CommandRunner,
    ExecRunner, ExecuteOptions, ExecuteResult, Result, DEFAULT_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Spawns the `gemini` CLI in headless mode (`-p <prompt>`).
pub struct GeminiAgent {
    binary_path: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    yolo: bool,
}

impl Default for GeminiAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiAgent {
    pub fn new() -> Self {
        Self {
            binary_path: "gemini".into(),
            timeout: DEFAULT_TIMEOUT,
            runner: Arc::new(ExecRunner),
            yolo: false,
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

    /// Pass `--yolo` to bypass confirmations.
    pub fn with_yolo(mut self, enabled: bool) -> Self {
        self.yolo = enabled;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }
}

#[async_trait]
impl AgentProvider for GeminiAgent {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn binary(&self) -> &str {
        &self.binary_path
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<ExecuteResult> {
        let start = Instant::now();
        let timeout = opts.timeout.unwrap_or(self.timeout);

        let mut args = vec!["-p".to_string(), opts.prompt.clone()];
        if self.yolo {
            args.push("--yolo".into());
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

        debug!(exit_code = run.exit_code, "gemini run finished");

        let json = extract_json(run.stdout.as_bytes())
            .and_then(|raw| serde_json::from_slice(raw).ok());

        Ok(ExecuteResult {
            stdout: run.stdout,
            stderr: run.stderr,
            exit_code: run.exit_code,
            duration: start.elapsed(),
            json,
        })
    }
}

/// Find the first balanced JSON object or array in raw output.
fn extract_json(output: &[u8]) -> Option<&[u8]> {
    if serde_json::from_slice::<serde_json::Value>(output).is_ok() {
        return Some(output);
    }

    let (start, opener, closer) = output.iter().enumerate().find_map(|(i, &b)| match b {
        b'{' => Some((i, b'{', b'}')),
        b'[' => Some((i, b'[', b']')),
        _ => None,
    })?;

    let mut depth = 0usize;
    for (i, b) in output.iter().enumerate().skip(start) {
        if *b == opener {
            depth += 1;
        } else if *b == closer {
            depth -= 1;
            if depth == 0 {
                let candidate = &output[start..=i];
                if serde_json::from_slice::<serde_json::Value>(candidate).is_ok() {
                    return Some(candidate);
                }
                return None;
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Budget-relative usage for Gemini. Session data under `~/.gemini/tmp/`
/// does not expose token counts, so totals are zero until it does; the
/// snapshot collector stores locals of zero and no inferred budget.
pub struct GeminiUsage {
    data_path: PathBuf,
}

impl Default for GeminiUsage {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_path: home.join(".gemini"),
        }
    }
}

impl GeminiUsage {
    pub fn with_path(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }
}

impl BudgetRelativeUsage for GeminiUsage {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn used_percent(&self, mode: BudgetMode, weekly_budget: i64) -> Result<f64> {
        if weekly_budget <= 0 {
            return Ok(0.0);
        }
        let tokens = match mode {
            BudgetMode::Daily => self.today_tokens()?,
            BudgetMode::Weekly => self.weekly_tokens()?,
        };
        if tokens <= 0 {
            return Ok(0.0);
        }
        let budget = match mode {
            BudgetMode::Daily => weekly_budget / 7,
            BudgetMode::Weekly => weekly_budget,
        };
        if budget <= 0 {
            return Ok(0.0);
        }
        Ok(tokens as f64 / budget as f64 * 100.0)
    }

    fn weekly_tokens(&self) -> Result<i64> {
        if !self.data_path.exists() {
            return Ok(0);
        }
        // Session format carries no token counts today.
        Ok(0)
    }

    fn today_tokens(&self) -> Result<i64> {
        if !self.data_path.exists() {
            return Ok(0);
        }
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
