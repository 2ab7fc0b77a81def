//! Per-run allowance computation under caps, reserves, and the end-of-week
//! boost.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use ns_agents::UsageProbe;
use ns_core::config::{BudgetMode, Config};
use tracing::debug;

/// Used when the configured cap is zero or missing.
const DEFAULT_MAX_PERCENT: u32 = 50;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("invalid weekly budget for provider {provider}: {budget}")]
    InvalidBudget { provider: String, budget: i64 },
    #[error("no usage probe for provider {0}")]
    UnknownProvider(String),
    #[error("usage: {0}")]
    Usage(#[from] ns_agents::AgentError),
    #[error(transparent)]
    Store(#[from] ns_core::store::StoreError),
}

pub type Result<T> = std::result::Result<T, BudgetError>;

// ---------------------------------------------------------------------------
// Budget source
// ---------------------------------------------------------------------------

/// Supplies the weekly budget the engine divides up; the calibrator is the
/// production implementation.
#[async_trait]
pub trait BudgetSource: Send + Sync {
    async fn weekly_budget(&self, provider: &str) -> Result<i64>;
}

#[async_trait]
impl BudgetSource for crate::calibrator::Calibrator {
    async fn weekly_budget(&self, provider: &str) -> Result<i64> {
        Ok(self.budget(provider).await?)
    }
}

// ---------------------------------------------------------------------------
// Allowance
// ---------------------------------------------------------------------------

/// The calculated allowance plus the inputs that produced it, for display.
#[derive(Debug, Clone)]
pub struct Allowance {
    /// Final token allowance for this run.
    pub allowance: i64,
    /// Base budget: daily slice in daily mode, remaining weekly in weekly.
    pub budget_base: i64,
    pub used_percent: f64,
    pub reserve_amount: i64,
    pub mode: BudgetMode,
    /// Days until reset (weekly mode only).
    pub remaining_days: i64,
    /// End-of-week multiplier (weekly mode only).
    pub multiplier: f64,
}

impl Allowance {
    pub fn summary(&self, provider: &str) -> String {
        match self.mode {
            BudgetMode::Daily => format!(
                "{provider}: {:.1}% used today, {} tokens allowed (daily budget: {}, reserve: {})",
                self.used_percent, self.allowance, self.budget_base, self.reserve_amount
            ),
            BudgetMode::Weekly => format!(
                "{provider}: {:.1}% used this week ({} days left), {} tokens allowed \
                 (remaining: {}, reserve: {}, multiplier: {:.1}x)",
                self.used_percent,
                self.remaining_days,
                self.allowance,
                self.budget_base,
                self.reserve_amount,
                self.multiplier
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Calculates token allowances per provider.
pub struct Manager {
    mode: BudgetMode,
    max_percent: u32,
    reserve_percent: u32,
    aggressive_end_of_week: bool,
    source: Arc<dyn BudgetSource>,
    probes: HashMap<String, UsageProbe>,
    now_override: Option<DateTime<Utc>>,
}

impl Manager {
    pub fn new(
        config: &Config,
        source: Arc<dyn BudgetSource>,
        probes: HashMap<String, UsageProbe>,
    ) -> Self {
        let max_percent = if config.budget.max_percent == 0 {
            DEFAULT_MAX_PERCENT
        } else {
            config.budget.max_percent
        };
        Self {
            mode: config.budget.mode,
            max_percent,
            reserve_percent: config.budget.reserve_percent,
            aggressive_end_of_week: config.budget.aggressive_end_of_week,
            source,
            probes,
            now_override: None,
        }
    }

    /// Pin the clock (tests).
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now_override = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_override.unwrap_or_else(Utc::now)
    }

    fn probe(&self, provider: &str) -> Result<&UsageProbe> {
        self.probes
            .get(provider)
            .ok_or_else(|| BudgetError::UnknownProvider(provider.to_string()))
    }

    /// How many tokens a run on this provider may consume right now.
    pub async fn calculate_allowance(&self, provider: &str) -> Result<Allowance> {
        let weekly_budget = self.source.weekly_budget(provider).await?;
        if weekly_budget <= 0 {
            return Err(BudgetError::InvalidBudget {
                provider: provider.to_string(),
                budget: weekly_budget,
            });
        }

        let used_percent = self.used_percent(provider, weekly_budget)?;

        let mut result = match self.mode {
            BudgetMode::Daily => self.daily_allowance(weekly_budget, used_percent),
            BudgetMode::Weekly => {
                let remaining_days = self.days_until_reset(provider)?;
                self.weekly_allowance(weekly_budget, used_percent, remaining_days)
            }
        };
        self.apply_reserve(&mut result);

        debug!(
            provider,
            allowance = result.allowance,
            base = result.budget_base,
            used = result.used_percent,
            mode = result.mode.as_str(),
            "allowance calculated"
        );
        Ok(result)
    }

    /// Whether the current allowance covers an estimated task cost.
    pub async fn can_run(&self, provider: &str, estimated_tokens: i64) -> Result<bool> {
        Ok(self.calculate_allowance(provider).await?.allowance >= estimated_tokens)
    }

    fn used_percent(&self, provider: &str, weekly_budget: i64) -> Result<f64> {
        match self.probe(provider)? {
            UsageProbe::BudgetRelative(u) => Ok(u.used_percent(self.mode, weekly_budget)?),
            UsageProbe::SelfReporting(u) => Ok(u.used_percent(self.mode)?),
        }
    }

    /// Daily mode: each night gets up to max_percent of that day's slice.
    fn daily_allowance(&self, weekly_budget: i64, used_percent: f64) -> Allowance {
        let daily_budget = weekly_budget / 7;
        let available_today = daily_budget as f64 * (1.0 - used_percent / 100.0);
        let mut allowance = available_today * self.max_percent as f64 / 100.0;
        if allowance > available_today {
            allowance = available_today;
        }

        Allowance {
            allowance: allowance.max(0.0) as i64,
            budget_base: daily_budget,
            used_percent,
            reserve_amount: 0,
            mode: BudgetMode::Daily,
            remaining_days: 0,
            multiplier: 1.0,
        }
    }

    /// Weekly mode: each night gets up to max_percent of the remaining
    /// weekly budget spread over the days until reset.
    fn weekly_allowance(
        &self,
        weekly_budget: i64,
        used_percent: f64,
        remaining_days: i64,
    ) -> Allowance {
        let remaining_days = remaining_days.max(1);
        let remaining_weekly = weekly_budget as f64 * (1.0 - used_percent / 100.0);

        let multiplier = if self.aggressive_end_of_week && remaining_days <= 2 {
            (3 - remaining_days) as f64
        } else {
            1.0
        };

        let allowance = (remaining_weekly / remaining_days as f64)
            * self.max_percent as f64
            / 100.0
            * multiplier;

        Allowance {
            allowance: allowance.max(0.0) as i64,
            budget_base: remaining_weekly as i64,
            used_percent,
            reserve_amount: 0,
            mode: BudgetMode::Weekly,
            remaining_days,
            multiplier,
        }
    }

    fn apply_reserve(&self, result: &mut Allowance) {
        let reserve = result.budget_base as f64 * self.reserve_percent as f64 / 100.0;
        result.reserve_amount = reserve as i64;
        result.allowance = ((result.allowance as f64 - reserve).max(0.0)) as i64;
    }

    /// Days until the weekly budget resets. Claude and Gemini reset weekly
    /// on Sunday; Codex reports its own reset time.
    pub fn days_until_reset(&self, provider: &str) -> Result<i64> {
        match self.probe(provider)? {
            UsageProbe::BudgetRelative(_) => {
                let weekday = self.now().weekday().num_days_from_sunday() as i64;
                if weekday == 0 {
                    Ok(7)
                } else {
                    Ok(7 - weekday)
                }
            }
            UsageProbe::SelfReporting(u) => {
                let Ok(Some(reset)) = u.reset_time(BudgetMode::Weekly) else {
                    return Ok(7);
                };
                let hours = (reset - self.now()).num_hours();
                let days = (hours as f64 / 24.0).ceil() as i64;
                Ok(days.max(1))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ns_agents::{BudgetRelativeUsage, SelfReportingUsage};
    use ns_core::config::BudgetConfig;

    struct FixedBudget(i64);

    #[async_trait]
    impl BudgetSource for FixedBudget {
        async fn weekly_budget(&self, _provider: &str) -> Result<i64> {
            Ok(self.0)
        }
    }

    struct FixedRelative {
        name: &'static str,
        pct: f64,
    }

    impl BudgetRelativeUsage for FixedRelative {
        fn name(&self) -> &'static str {
            self.name
        }
        fn used_percent(&self, _mode: BudgetMode, _weekly_budget: i64) -> ns_agents::Result<f64> {
            Ok(self.pct)
        }
        fn weekly_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
        fn today_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
    }

    struct FixedSelfReporting {
        pct: f64,
        reset: Option<DateTime<Utc>>,
    }

    impl SelfReportingUsage for FixedSelfReporting {
        fn name(&self) -> &'static str {
            "codex"
        }
        fn used_percent(&self, _mode: BudgetMode) -> ns_agents::Result<f64> {
            Ok(self.pct)
        }
        fn reset_time(&self, _mode: BudgetMode) -> ns_agents::Result<Option<DateTime<Utc>>> {
            Ok(self.reset)
        }
        fn weekly_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
        fn today_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
    }

    fn manager(budget_cfg: BudgetConfig, probes: HashMap<String, UsageProbe>, weekly: i64) -> Manager {
        let mut cfg = Config::default();
        cfg.budget = budget_cfg;
        Manager::new(&cfg, Arc::new(FixedBudget(weekly)), probes)
    }

    fn claude_probe(pct: f64) -> (String, UsageProbe) {
        (
            "claude".to_string(),
            UsageProbe::BudgetRelative(Arc::new(FixedRelative {
                name: "claude",
                pct,
            })),
        )
    }

    #[tokio::test]
    async fn daily_allowance_matches_reference_numbers() {
        let cfg = BudgetConfig {
            mode: BudgetMode::Daily,
            max_percent: 75,
            reserve_percent: 0,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 700_000);

        let a = m.calculate_allowance("claude").await.unwrap();
        assert_eq!(a.budget_base, 100_000);
        assert_eq!(a.allowance, 75_000);
        assert_eq!(a.mode, BudgetMode::Daily);
    }

    #[tokio::test]
    async fn allowance_is_bounded_by_base_and_never_negative() {
        for (max_percent, used) in [(100u32, 0.0), (100, 50.0), (25, 100.0), (1, 99.0)] {
            let cfg = BudgetConfig {
                mode: BudgetMode::Daily,
                max_percent,
                reserve_percent: 0,
                ..BudgetConfig::default()
            };
            let m = manager(cfg, HashMap::from([claude_probe(used)]), 700_000);
            let a = m.calculate_allowance("claude").await.unwrap();
            assert!(a.allowance >= 0, "used={used}");
            assert!(a.allowance <= a.budget_base, "used={used}");
        }
    }

    #[tokio::test]
    async fn reserve_is_subtracted_and_clamped() {
        let cfg = BudgetConfig {
            mode: BudgetMode::Daily,
            max_percent: 75,
            reserve_percent: 10,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 700_000);
        let a = m.calculate_allowance("claude").await.unwrap();
        // 75k minus 10% of the 100k base
        assert_eq!(a.reserve_amount, 10_000);
        assert_eq!(a.allowance, 65_000);

        let cfg = BudgetConfig {
            mode: BudgetMode::Daily,
            max_percent: 5,
            reserve_percent: 90,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 700_000);
        let a = m.calculate_allowance("claude").await.unwrap();
        assert_eq!(a.allowance, 0);
    }

    #[tokio::test]
    async fn weekly_mode_spreads_remaining_budget() {
        let cfg = BudgetConfig {
            mode: BudgetMode::Weekly,
            max_percent: 100,
            reserve_percent: 0,
            ..BudgetConfig::default()
        };
        // Wednesday: 4 days until Sunday reset.
        let now = Utc.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap();
        let m = manager(cfg, HashMap::from([claude_probe(50.0)]), 700_000).with_now(now);

        let a = m.calculate_allowance("claude").await.unwrap();
        assert_eq!(a.remaining_days, 4);
        assert_eq!(a.budget_base, 350_000);
        assert_eq!(a.allowance, 87_500);
        assert_eq!(a.multiplier, 1.0);
    }

    #[tokio::test]
    async fn aggressive_end_of_week_doubles_on_last_day() {
        let base = BudgetConfig {
            mode: BudgetMode::Weekly,
            max_percent: 100,
            reserve_percent: 0,
            aggressive_end_of_week: true,
            ..BudgetConfig::default()
        };

        // Saturday: one day left -> multiplier 2.
        let saturday = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let m = manager(base.clone(), HashMap::from([claude_probe(0.0)]), 700_000)
            .with_now(saturday);
        let a = m.calculate_allowance("claude").await.unwrap();
        assert_eq!(a.remaining_days, 1);
        assert_eq!(a.multiplier, 2.0);
        assert_eq!(a.allowance, 700_000 * 2);

        // Friday: two days left -> multiplier 1 (penultimate-day boost only
        // kicks in on the final day).
        let friday = Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap();
        let m = manager(base, HashMap::from([claude_probe(0.0)]), 700_000).with_now(friday);
        let a = m.calculate_allowance("claude").await.unwrap();
        assert_eq!(a.remaining_days, 2);
        assert_eq!(a.multiplier, 1.0);
    }

    #[tokio::test]
    async fn codex_reset_time_drives_remaining_days() {
        let now = Utc.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap();
        let probes = HashMap::from([(
            "codex".to_string(),
            UsageProbe::SelfReporting(Arc::new(FixedSelfReporting {
                pct: 0.0,
                reset: Some(now + chrono::Duration::hours(60)),
            })),
        )]);
        let cfg = BudgetConfig {
            mode: BudgetMode::Weekly,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, probes, 700_000).with_now(now);
        assert_eq!(m.days_until_reset("codex").unwrap(), 3);

        // Reset in the past still floors at one day.
        let probes = HashMap::from([(
            "codex".to_string(),
            UsageProbe::SelfReporting(Arc::new(FixedSelfReporting {
                pct: 0.0,
                reset: Some(now - chrono::Duration::hours(5)),
            })),
        )]);
        let cfg = BudgetConfig {
            mode: BudgetMode::Weekly,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, probes, 700_000).with_now(now);
        assert_eq!(m.days_until_reset("codex").unwrap(), 1);
    }

    #[tokio::test]
    async fn sunday_reset_math_for_budget_relative_providers() {
        let cfg = BudgetConfig::default();
        // Sunday -> a full week remains.
        let sunday = Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap();
        let m = manager(cfg.clone(), HashMap::from([claude_probe(0.0)]), 700_000)
            .with_now(sunday);
        assert_eq!(m.days_until_reset("claude").unwrap(), 7);

        // Thursday -> 3 days.
        let thursday = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap();
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 700_000).with_now(thursday);
        assert_eq!(m.days_until_reset("claude").unwrap(), 3);
    }

    #[tokio::test]
    async fn can_run_compares_against_allowance() {
        let cfg = BudgetConfig {
            mode: BudgetMode::Daily,
            max_percent: 75,
            reserve_percent: 0,
            ..BudgetConfig::default()
        };
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 700_000);
        assert!(m.can_run("claude", 75_000).await.unwrap());
        assert!(!m.can_run("claude", 75_001).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_budget_is_an_error() {
        let cfg = BudgetConfig::default();
        let m = manager(cfg, HashMap::from([claude_probe(0.0)]), 0);
        let err = m.calculate_allowance("claude").await.unwrap_err();
        assert!(matches!(err, BudgetError::InvalidBudget { .. }));
    }
}
