//! Usage snapshot collection: one typed row per tick combining locally
//! counted tokens with the optionally scraped status-screen percentage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, LocalResult, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use ns_agents::UsageProbe;
use ns_core::store::{SnapshotRow, Store, StoreError};
use tracing::{debug, warn};

/// Weekly-percentage scraping as the collector sees it. The tmux-driving
/// implementation lives in the session layer; tests inject fixed values.
#[async_trait]
pub trait UsageScraper: Send + Sync {
    /// Returns the weekly used percentage, or `None` when the scrape failed
    /// or produced nothing parseable this cycle.
    async fn scrape_weekly_pct(&self, provider: &str) -> Option<f64>;
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no usage probe for provider {0}")]
    UnknownProvider(String),
    #[error("usage data: {0}")]
    Usage(#[from] ns_agents::AgentError),
}

/// Gathers and stores usage snapshots.
pub struct Collector {
    store: Arc<Store>,
    probes: Vec<UsageProbe>,
    scraper: Option<Arc<dyn UsageScraper>>,
    week_start_day: Weekday,
}

impl Collector {
    pub fn new(
        store: Arc<Store>,
        probes: Vec<UsageProbe>,
        scraper: Option<Arc<dyn UsageScraper>>,
        week_start_day: Weekday,
    ) -> Self {
        Self {
            store,
            probes,
            scraper,
            week_start_day,
        }
    }

    fn probe(&self, provider: &str) -> Option<&UsageProbe> {
        self.probes.iter().find(|p| p.provider() == provider)
    }

    pub fn providers(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.provider()).collect()
    }

    /// Collect and store one snapshot for the provider. A scrape failure is
    /// not an error; the row still records the local counts.
    pub async fn take_snapshot(&self, provider: &str) -> Result<SnapshotRow, CollectError> {
        let provider = provider.to_lowercase();
        let probe = self
            .probe(&provider)
            .ok_or_else(|| CollectError::UnknownProvider(provider.clone()))?;

        let local_weekly = probe.weekly_tokens()?;
        let local_daily = probe.today_tokens()?;

        let scraped_pct = match &self.scraper {
            Some(scraper) => scraper
                .scrape_weekly_pct(&provider)
                .await
                .filter(|pct| (0.0..=100.0).contains(pct)),
            None => None,
        };
        if scraped_pct.is_none() {
            debug!(provider, "no scraped percentage this cycle");
        }

        let now = Utc::now();
        let local_now = now.with_timezone(&Local);
        let week_start = start_of_week(now, self.week_start_day);
        let iso = week_start.with_timezone(&Local).date_naive().iso_week();

        // An inferred budget needs both a positive percentage and real local
        // counts; locals of zero leave the field absent rather than zero.
        let inferred_budget = match scraped_pct {
            Some(pct) if pct > 0.0 && local_weekly > 0 => {
                Some((local_weekly as f64 / (pct / 100.0)).round() as i64)
            }
            _ => None,
        };

        let mut row = SnapshotRow {
            id: 0,
            provider: provider.clone(),
            timestamp: now,
            week_start,
            local_tokens: local_weekly,
            local_daily,
            scraped_pct,
            inferred_budget,
            day_of_week: local_now.weekday().num_days_from_sunday() as i64,
            hour_of_day: local_now.hour() as i64,
            week_number: iso.week() as i64,
            year: iso.year() as i64,
        };
        row.id = self.store.insert_snapshot(&row).await?;

        debug!(
            provider,
            local_weekly,
            local_daily,
            scraped_pct = ?scraped_pct,
            inferred = ?inferred_budget,
            "snapshot stored"
        );
        Ok(row)
    }

    /// Collect snapshots for every configured provider, absorbing per-provider
    /// failures.
    pub async fn take_all(&self) -> Vec<SnapshotRow> {
        let mut rows = Vec::new();
        for provider in self.providers() {
            match self.take_snapshot(provider).await {
                Ok(row) => rows.push(row),
                Err(e) => warn!(provider, error = %e, "snapshot failed"),
            }
        }
        rows
    }

    pub async fn latest(&self, provider: &str, n: i64) -> Result<Vec<SnapshotRow>, StoreError> {
        self.store.latest_snapshots(provider, n).await
    }

    /// Snapshots from the current week, oldest first.
    pub async fn since_week_start(&self, provider: &str) -> Result<Vec<SnapshotRow>, StoreError> {
        let week_start = start_of_week(Utc::now(), self.week_start_day);
        self.store.snapshots_for_week(provider, week_start).await
    }

    pub async fn prune(&self, retention_days: i64) -> Result<u64, StoreError> {
        self.store.prune_snapshots(retention_days).await
    }
}

/// Midnight of the configured week-start weekday on or before `now`,
/// computed in the local time zone.
pub fn start_of_week(now: DateTime<Utc>, week_start_day: Weekday) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let delta = (7 + local.weekday().num_days_from_sunday() as i64
        - week_start_day.num_days_from_sunday() as i64)
        % 7;
    let start_date = local.date_naive() - chrono::Duration::days(delta);
    let naive = start_date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        LocalResult::None => Utc.from_utc_datetime(&naive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ns_agents::{BudgetRelativeUsage, SelfReportingUsage};
    use ns_core::config::BudgetMode;

    struct FixedRelative {
        weekly: i64,
        daily: i64,
    }

    impl BudgetRelativeUsage for FixedRelative {
        fn name(&self) -> &'static str {
            "claude"
        }
        fn used_percent(&self, _mode: BudgetMode, _weekly_budget: i64) -> ns_agents::Result<f64> {
            Ok(0.0)
        }
        fn weekly_tokens(&self) -> ns_agents::Result<i64> {
            Ok(self.weekly)
        }
        fn today_tokens(&self) -> ns_agents::Result<i64> {
            Ok(self.daily)
        }
    }

    struct ZeroSelfReporting;

    impl SelfReportingUsage for ZeroSelfReporting {
        fn name(&self) -> &'static str {
            "codex"
        }
        fn used_percent(&self, _mode: BudgetMode) -> ns_agents::Result<f64> {
            Ok(0.0)
        }
        fn reset_time(&self, _mode: BudgetMode) -> ns_agents::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
        fn weekly_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
        fn today_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
    }

    struct FixedScraper(Option<f64>);

    #[async_trait]
    impl UsageScraper for FixedScraper {
        async fn scrape_weekly_pct(&self, _provider: &str) -> Option<f64> {
            self.0
        }
    }

    async fn collector_with(
        weekly: i64,
        daily: i64,
        pct: Option<f64>,
    ) -> (Collector, Arc<Store>) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let probes = vec![
            UsageProbe::BudgetRelative(Arc::new(FixedRelative { weekly, daily })),
            UsageProbe::SelfReporting(Arc::new(ZeroSelfReporting)),
        ];
        let collector = Collector::new(
            store.clone(),
            probes,
            Some(Arc::new(FixedScraper(pct))),
            Weekday::Mon,
        );
        (collector, store)
    }

    #[tokio::test]
    async fn snapshot_infers_budget_from_locals_and_pct() {
        let (collector, _store) = collector_with(300_000, 40_000, Some(30.0)).await;
        let row = collector.take_snapshot("claude").await.unwrap();

        assert_eq!(row.local_tokens, 300_000);
        assert_eq!(row.local_daily, 40_000);
        assert_eq!(row.scraped_pct, Some(30.0));
        assert_eq!(row.inferred_budget, Some(1_000_000));
        assert_eq!(row.week_start, start_of_week(row.timestamp, Weekday::Mon));
    }

    #[tokio::test]
    async fn zero_locals_leave_inferred_absent() {
        let (collector, _store) = collector_with(0, 0, Some(40.0)).await;
        let row = collector.take_snapshot("codex").await.unwrap();
        assert_eq!(row.local_tokens, 0);
        assert_eq!(row.scraped_pct, Some(40.0));
        assert_eq!(row.inferred_budget, None);
    }

    #[tokio::test]
    async fn scrape_failure_still_stores_locals() {
        let (collector, store) = collector_with(120_000, 9_000, None).await;
        let row = collector.take_snapshot("claude").await.unwrap();
        assert_eq!(row.scraped_pct, None);
        assert_eq!(row.inferred_budget, None);

        let stored = store.latest_snapshots("claude", 1).await.unwrap();
        assert_eq!(stored[0].local_tokens, 120_000);
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let (collector, _store) = collector_with(0, 0, None).await;
        let err = collector.take_snapshot("mystery").await.unwrap_err();
        assert!(matches!(err, CollectError::UnknownProvider(_)));
    }

    #[test]
    fn week_start_is_midnight_of_configured_weekday() {
        // A Saturday.
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 15, 30, 0).unwrap();
        let start = start_of_week(now, Weekday::Mon);
        let local = start.with_timezone(&Local);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!(local.time(), NaiveTime::MIN);
        assert!(start <= now);
        assert!(now - start < chrono::Duration::days(7));
    }

    #[test]
    fn week_start_never_lands_in_the_future() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        for day in [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Wed,
            Weekday::Sat,
        ] {
            let start = start_of_week(now, day);
            assert!(start <= now, "week_start_day={day}");
            assert!(now - start < chrono::Duration::days(7), "week_start_day={day}");
            assert_eq!(start.with_timezone(&Local).weekday(), day);
        }
    }
}
