//! Thin wrapper around a detached tmux session.
//!
//! All tmux invocations go through a [`CommandRunner`] so tests can inject a
//! fake and the scraper's drive sequence stays table-testable.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("tmux not found on PATH")]
    NotFound,
    #[error("tmux {command}: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("timed out waiting for pane output")]
    WaitTimeout,
}

pub type Result<T> = std::result::Result<T, TmuxError>;

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Executes tmux commands. Production uses [`ExecRunner`]; tests inject fakes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, name: &str, args: &[String]) -> std::io::Result<Vec<u8>>;
}

/// Runs commands via `tokio::process`, returning combined stdout/stderr.
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, name: &str, args: &[String]) -> std::io::Result<Vec<u8>> {
        let output = Command::new(name).args(args).output().await?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A detached tmux session with a single pane.
pub struct Session {
    name: String,
    work_dir: Option<String>,
    width: u16,
    height: u16,
    runner: Arc<dyn CommandRunner>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            work_dir: None,
            width: 0,
            height: 0,
            runner: Arc::new(ExecRunner),
        }
    }

    pub fn with_size(mut self, width: u16, height: u16) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the detached session and apply the pane size.
    pub async fn start(&self) -> Result<()> {
        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            self.name.clone(),
        ];
        if let Some(dir) = &self.work_dir {
            args.push("-c".to_string());
            args.push(dir.clone());
        }
        self.run("new-session", args).await?;

        if self.width > 0 && self.height > 0 {
            self.resize(self.width, self.height).await?;
        }
        Ok(())
    }

    pub async fn resize(&self, width: u16, height: u16) -> Result<()> {
        self.run(
            "resize-pane",
            vec![
                "resize-pane".into(),
                "-t".into(),
                self.name.clone(),
                "-x".into(),
                width.to_string(),
                "-y".into(),
                height.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Send keys to the pane (literal text or tmux key names like `Enter`).
    pub async fn send_keys(&self, keys: &[&str]) -> Result<()> {
        let mut args = vec!["send-keys".to_string(), "-t".into(), self.name.clone()];
        args.extend(keys.iter().map(|k| k.to_string()));
        self.run("send-keys", args).await?;
        Ok(())
    }

    /// Capture the pane contents; `extra` passes through additional
    /// capture-pane flags (e.g. `-S -200` for scrollback).
    pub async fn capture_pane(&self, extra: &[&str]) -> Result<String> {
        let mut args = vec![
            "capture-pane".to_string(),
            "-t".into(),
            self.name.clone(),
            "-p".into(),
        ];
        args.extend(extra.iter().map(|k| k.to_string()));
        let out = self.run("capture-pane", args).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub async fn kill(&self) {
        // Session teardown is best-effort; the pane may already be gone.
        let _ = self
            .run(
                "kill-session",
                vec!["kill-session".into(), "-t".into(), self.name.clone()],
            )
            .await;
    }

    /// Poll capture-pane until the pattern matches the ANSI-stripped output
    /// or the timeout elapses. Returns the last captured output on success.
    pub async fn wait_for_pattern(
        &self,
        pattern: &Regex,
        timeout: Duration,
        poll_interval: Duration,
        extra: &[&str],
    ) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(output) = self.capture_pane(extra).await {
                if pattern.is_match(&strip_ansi(&output)) {
                    return Ok(output);
                }
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(TmuxError::WaitTimeout);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Poll until the pane shows a rendered TUI: more than `min_lines`
    /// non-empty lines.
    pub async fn wait_for_render(
        &self,
        min_lines: usize,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(output) = self.capture_pane(&[]).await {
                let clean = strip_ansi(&output);
                if clean.lines().filter(|l| !l.trim().is_empty()).count() > min_lines {
                    return Ok(output);
                }
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(TmuxError::WaitTimeout);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn run(&self, command: &'static str, args: Vec<String>) -> Result<Vec<u8>> {
        self.runner
            .run("tmux", &args)
            .await
            .map_err(|e| TmuxError::Command {
                command,
                message: e.to_string(),
            })
    }
}

/// Whether tmux is installed.
pub fn tmux_available() -> bool {
    ns_core::exec::binary_on_path("tmux").is_some()
}

// ---------------------------------------------------------------------------
// ANSI stripping
// ---------------------------------------------------------------------------

static ANSI_RE: OnceLock<Regex> = OnceLock::new();

/// Remove SGR/cursor CSI sequences, OSC sequences, and charset selectors.
pub fn strip_ansi(input: &str) -> String {
    let re = ANSI_RE.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-9;?]*[a-zA-Z]|\][^\x07]*\x07|[()][A-Z0-9])")
            .expect("static ANSI pattern")
    });
    re.replace_all(input, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn strip_ansi_removes_sgr_and_osc() {
        let input = "\x1b[1;32mgreen\x1b[0m and \x1b]0;title\x07plain";
        assert_eq!(strip_ansi(input), "green and plain");
    }

    #[test]
    fn strip_ansi_removes_cursor_moves() {
        let input = "\x1b[2J\x1b[H top\x1b[10;5H mid ";
        assert_eq!(strip_ansi(input), "top mid");
    }

    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        capture_output: String,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _name: &str, args: &[String]) -> std::io::Result<Vec<u8>> {
            self.calls.lock().unwrap().push(args.to_vec());
            if args.first().map(String::as_str) == Some("capture-pane") {
                return Ok(self.capture_output.clone().into_bytes());
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn start_creates_detached_session_and_resizes() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
            capture_output: String::new(),
        });
        let session = Session::new("test-session")
            .with_size(120, 40)
            .with_runner(runner.clone());
        session.start().await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0][0], "new-session");
        assert!(calls[0].contains(&"-d".to_string()));
        assert_eq!(calls[1][0], "resize-pane");
        assert!(calls[1].contains(&"120".to_string()));
        assert!(calls[1].contains(&"40".to_string()));
    }

    #[tokio::test]
    async fn wait_for_pattern_matches_stripped_output() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
            capture_output: "\x1b[1mWeekly limit: 42% used\x1b[0m".into(),
        });
        let session = Session::new("t").with_runner(runner);
        let re = Regex::new(r"(?i)weekly\s+limit").unwrap();
        let out = session
            .wait_for_pattern(&re, Duration::from_secs(1), Duration::from_millis(10), &[])
            .await
            .unwrap();
        assert!(out.contains("42%"));
    }

    #[tokio::test]
    async fn wait_for_pattern_times_out() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
            capture_output: "nothing useful".into(),
        });
        let session = Session::new("t").with_runner(runner);
        let re = Regex::new("never-appears").unwrap();
        let err = session
            .wait_for_pattern(
                &re,
                Duration::from_millis(50),
                Duration::from_millis(10),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TmuxError::WaitTimeout));
    }
}
