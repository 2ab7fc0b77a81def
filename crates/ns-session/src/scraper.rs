//! Scrapes weekly usage percentages from provider status screens.
//!
//! The driver owns pane lifecycle, first-run prompt dismissal, and render
//! waiting; parsing is pure functions over ANSI-stripped text so it can be
//! tested against captured fixtures.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::tmux::{strip_ansi, tmux_available, CommandRunner, ExecRunner, Session, TmuxError};

const PANE_WIDTH: u16 = 120;
const PANE_HEIGHT: u16 = 40;
/// Overall budget for one scrape attempt.
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(45);
/// Bound for each inner wait (render, pattern).
const INNER_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Pause after typing a slash command so autocomplete can settle.
const AUTOCOMPLETE_SETTLE: Duration = Duration::from_millis(500);
/// A TUI counts as rendered once more than this many non-empty lines appear.
const RENDERED_LINES: usize = 5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Usage metadata scraped from a provider's status screen.
#[derive(Debug, Clone)]
pub struct UsageResult {
    pub provider: String,
    /// Weekly used percentage in `[0, 100]`.
    pub weekly_pct: f64,
    /// Best-effort reset time, when the screen shows one.
    pub reset_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub raw_output: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Tmux(#[from] TmuxError),
    #[error("scrape timed out")]
    Timeout,
    #[error("usage percent not found in pane output")]
    PercentNotFound,
}

pub type Result<T> = std::result::Result<T, ScrapeError>;

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// Drives an interactive provider CLI inside a detached tmux pane.
pub struct Scraper {
    runner: Arc<dyn CommandRunner>,
}

impl Default for Scraper {
    fn default() -> Self {
        Self::new()
    }
}

impl Scraper {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(ExecRunner),
        }
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Start Claude, run `/usage`, and parse the weekly used percent.
    pub async fn scrape_claude_usage(&self) -> Result<UsageResult> {
        self.scrape("claude", "claude", "/usage", claude_week_pattern(), parse_claude_weekly_pct)
            .await
    }

    /// Start Codex, run `/status`, and parse the weekly used percent.
    pub async fn scrape_codex_usage(&self) -> Result<UsageResult> {
        self.scrape("codex", "codex", "/status", codex_week_pattern(), parse_codex_weekly_pct)
            .await
    }

    async fn scrape(
        &self,
        provider: &str,
        cli: &str,
        status_command: &str,
        pattern: &Regex,
        parse: fn(&str) -> Option<f64>,
    ) -> Result<UsageResult> {
        if !tmux_available() {
            return Err(ScrapeError::Tmux(TmuxError::NotFound));
        }

        let session = Session::new(unique_session_name(provider))
            .with_size(PANE_WIDTH, PANE_HEIGHT)
            .with_runner(self.runner.clone());

        let result = tokio::time::timeout(
            SCRAPE_TIMEOUT,
            self.drive(&session, provider, cli, status_command, pattern, parse),
        )
        .await;
        session.kill().await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ScrapeError::Timeout),
        }
    }

    async fn drive(
        &self,
        session: &Session,
        provider: &str,
        cli: &str,
        status_command: &str,
        pattern: &Regex,
        parse: fn(&str) -> Option<f64>,
    ) -> Result<UsageResult> {
        session.start().await?;
        session.send_keys(&[cli, "Enter"]).await?;

        self.dismiss_known_prompts(session).await?;

        session
            .wait_for_render(RENDERED_LINES, INNER_TIMEOUT, POLL_INTERVAL)
            .await?;

        session.send_keys(&[status_command]).await?;
        tokio::time::sleep(AUTOCOMPLETE_SETTLE).await;
        session.send_keys(&["Enter"]).await?;

        let output = session
            .wait_for_pattern(pattern, INNER_TIMEOUT, POLL_INTERVAL, &["-S", "-200"])
            .await?;

        let clean = strip_ansi(&output);
        let weekly_pct = parse(&clean).ok_or(ScrapeError::PercentNotFound)?;
        let reset_at = parse_reset_time(&clean, Utc::now());

        debug!(provider, weekly_pct, reset = ?reset_at, "usage scraped");

        Ok(UsageResult {
            provider: provider.to_string(),
            weekly_pct,
            reset_at,
            scraped_at: Utc::now(),
            raw_output: clean,
        })
    }

    /// Dismiss known first-run prompts by string match. Unknown prompts are
    /// left alone; the render wait will time out instead.
    async fn dismiss_known_prompts(&self, session: &Session) -> Result<()> {
        let mut output = strip_ansi(&session.capture_pane(&["-S", "-50"]).await?);

        if output.contains("Do you trust") {
            session.send_keys(&["Enter"]).await?;
        }
        if output.contains("Update available") {
            session.send_keys(&["Down", "Enter"]).await?;
            if let Ok(next) = session.capture_pane(&["-S", "-50"]).await {
                output = strip_ansi(&next);
            }
        }
        if output.contains("allow") && output.contains("to work") {
            session.send_keys(&["Enter"]).await?;
        }
        Ok(())
    }
}

fn unique_session_name(provider: &str) -> String {
    format!("nightshift-usage-{provider}-{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Parsing (pure)
// ---------------------------------------------------------------------------

static CLAUDE_WEEK_RE: OnceLock<Regex> = OnceLock::new();
static CLAUDE_PCT_RE: OnceLock<Regex> = OnceLock::new();
static CLAUDE_PCT_FALLBACK_RE: OnceLock<Regex> = OnceLock::new();
static CODEX_WEEK_RE: OnceLock<Regex> = OnceLock::new();
static CODEX_PCT_RE: OnceLock<Regex> = OnceLock::new();
static RESET_REL_RE: OnceLock<Regex> = OnceLock::new();
static RESET_ABS_RE: OnceLock<Regex> = OnceLock::new();

fn claude_week_pattern() -> &'static Regex {
    CLAUDE_WEEK_RE
        .get_or_init(|| Regex::new(r"(?i)current\s+week").expect("static pattern"))
}

fn codex_week_pattern() -> &'static Regex {
    CODEX_WEEK_RE.get_or_init(|| Regex::new(r"(?i)weekly\s+limit").expect("static pattern"))
}

/// Claude `/usage`: the percentage after "current week (all models)" is
/// already a used percent. The window may span lines.
pub fn parse_claude_weekly_pct(output: &str) -> Option<f64> {
    let re = CLAUDE_PCT_RE.get_or_init(|| {
        Regex::new(r"(?i)current\s+week\s*\(all\s+models\)[^%]{0,400}?(\d{1,3}(?:\.\d+)?)%")
            .expect("static pattern")
    });
    if let Some(caps) = re.captures(output) {
        return parse_pct(&caps[1]);
    }
    // Older screens label the row "Current week" without the qualifier.
    let fallback = CLAUDE_PCT_FALLBACK_RE.get_or_init(|| {
        Regex::new(r"(?i)current\s+week[^%]{0,400}?(\d{1,3}(?:\.\d+)?)%")
            .expect("static pattern")
    });
    fallback
        .captures(output)
        .and_then(|caps| parse_pct(&caps[1]))
}

/// Codex `/status`: "weekly limit" followed by a percent with an optional
/// `left`/`used` qualifier. `left` converts to used via `100 - x`.
pub fn parse_codex_weekly_pct(output: &str) -> Option<f64> {
    let re = CODEX_PCT_RE.get_or_init(|| {
        Regex::new(r"(?i)weekly\s+limit[^%]{0,400}?(\d{1,3}(?:\.\d+)?)%\s*(left|used)?")
            .expect("static pattern")
    });
    let caps = re.captures(output)?;
    let pct = parse_pct(&caps[1])?;
    match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(q) if q == "left" => Some(100.0 - pct),
        _ => Some(pct),
    }
}

fn parse_pct(raw: &str) -> Option<f64> {
    let pct: f64 = raw.trim().parse().ok()?;
    if (0.0..=100.0).contains(&pct) {
        Some(pct)
    } else {
        None
    }
}

/// Best-effort reset time: either an explicit RFC 3339 timestamp or a
/// relative "resets in Nd Mh" phrase.
pub fn parse_reset_time(output: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let abs = RESET_ABS_RE.get_or_init(|| {
        Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{4}-\d{2}-\d{2}T[0-9:.+\-]+(?:Z|[+\-]\d{2}:\d{2})?)")
            .expect("static pattern")
    });
    if let Some(caps) = abs.captures(output) {
        if let Ok(t) = DateTime::parse_from_rfc3339(&caps[1]) {
            return Some(t.with_timezone(&Utc));
        }
    }

    let rel = RESET_REL_RE.get_or_init(|| {
        Regex::new(r"(?i)resets?\s+in\s+(?:(\d+)\s*d(?:ays?)?)?\s*(?:(\d+)\s*h(?:ours?)?)?")
            .expect("static pattern")
    });
    if let Some(caps) = rel.captures(output) {
        let days: i64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let hours: i64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        if days > 0 || hours > 0 {
            return Some(now + chrono::Duration::days(days) + chrono::Duration::hours(hours));
        }
        warn!("reset phrase matched but carried no duration");
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn parses_claude_weekly_pct() {
        let cases = [
            ("Current week (all models)\n  ██████░░░░ 34% used", Some(34.0)),
            ("CURRENT WEEK (ALL MODELS)   12.5%", Some(12.5)),
            // qualifier missing -> fallback row label
            ("Current week ......... 7%", Some(7.0)),
            ("Session usage: 80%\nno week row here", None),
        ];
        for (input, want) in cases {
            assert_eq!(parse_claude_weekly_pct(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn parses_codex_weekly_pct_with_qualifiers() {
        let cases = [
            ("Weekly limit: 62% used", Some(62.0)),
            ("weekly limit\n  [#####-----] 40% left", Some(60.0)),
            ("Weekly limit ......... 15%", Some(15.0)),
            ("5h limit: 90% used", None),
        ];
        for (input, want) in cases {
            assert_eq!(parse_codex_weekly_pct(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn percent_must_be_in_range() {
        assert_eq!(parse_pct("101"), None);
        assert_eq!(parse_pct("0"), Some(0.0));
        assert_eq!(parse_pct("100"), Some(100.0));
    }

    #[test]
    fn reset_time_relative_and_absolute() {
        let now = Utc::now();
        let rel = parse_reset_time("Weekly limit resets in 2d 3h", now).unwrap();
        assert_eq!(rel, now + chrono::Duration::days(2) + chrono::Duration::hours(3));

        let abs = parse_reset_time("resets at 2026-08-09T00:00:00Z", now).unwrap();
        assert_eq!(abs.to_rfc3339(), "2026-08-09T00:00:00+00:00");

        assert!(parse_reset_time("no reset mentioned", now).is_none());
    }

    // -- scripted driver test --

    struct ScriptedRunner {
        calls: Mutex<Vec<Vec<String>>>,
        captures: Mutex<VecDeque<String>>,
    }

    impl ScriptedRunner {
        fn new(captures: Vec<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                captures: Mutex::new(captures.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _name: &str, args: &[String]) -> std::io::Result<Vec<u8>> {
            self.calls.lock().unwrap().push(args.to_vec());
            if args.first().map(String::as_str) == Some("capture-pane") {
                let mut captures = self.captures.lock().unwrap();
                // Keep replaying the final frame once the script runs out.
                let frame = if captures.len() > 1 {
                    captures.pop_front().unwrap_or_default()
                } else {
                    captures.front().cloned().unwrap_or_default()
                };
                return Ok(frame.into_bytes());
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn drives_claude_through_trust_prompt_to_usage_screen() {
        let rendered = "Claude Code v2\nline\nline\nline\nline\nline\nline";
        let usage = "Settings\nUsage\nCurrent week (all models)\n  30% used\nmore\nlines\nhere";
        let runner = Arc::new(ScriptedRunner::new(vec![
            "Do you trust this folder?",
            rendered,
            usage,
        ]));
        let scraper = Scraper::with_runner(runner.clone());

        // tmux_available() gate is environment-dependent; drive directly.
        let session = Session::new("t")
            .with_size(PANE_WIDTH, PANE_HEIGHT)
            .with_runner(runner.clone());
        let result = scraper
            .drive(
                &session,
                "claude",
                "claude",
                "/usage",
                claude_week_pattern(),
                parse_claude_weekly_pct,
            )
            .await
            .unwrap();

        assert_eq!(result.provider, "claude");
        assert_eq!(result.weekly_pct, 30.0);

        let calls = runner.calls.lock().unwrap();
        let sent: Vec<String> = calls
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("send-keys"))
            .map(|c| c[3..].join(" "))
            .collect();
        assert!(sent.contains(&"claude Enter".to_string()));
        // trust prompt dismissed before the status command
        assert_eq!(sent[1], "Enter");
        assert!(sent.contains(&"/usage".to_string()));
    }

    #[tokio::test]
    async fn missing_percent_is_a_parse_failure() {
        let rendered = "a\nb\nc\nd\ne\nf\ng";
        let runner = Arc::new(ScriptedRunner::new(vec![
            "starting up",
            rendered,
            "weekly limit shown without a number",
        ]));
        let scraper = Scraper::with_runner(runner.clone());
        let session = Session::new("t").with_runner(runner);

        let err = scraper
            .drive(
                &session,
                "codex",
                "codex",
                "/status",
                codex_week_pattern(),
                parse_codex_weekly_pct,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::PercentNotFound));
    }
}
