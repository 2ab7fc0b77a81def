//! Weekly-budget calibration: infer the opaque subscription allowance by
//! correlating locally counted tokens with scraped percentages.

use std::sync::Arc;

use chrono::{Utc, Weekday};
use ns_core::config::{BillingMode, Config};
use ns_core::store::{Store, StoreError};
use serde::Serialize;
use tracing::debug;

use crate::snapshots::start_of_week;

/// Samples outside this band are too noisy to calibrate from: near 0% the
/// ratio explodes, near 100% the screen may have clamped.
const MIN_PCT: f64 = 5.0;
const MAX_PCT: f64 = 95.0;
/// Keep samples within this many MADs of the median.
const MAD_FACTOR: f64 = 2.0;
/// Coefficient-of-variation bound separating "low variance" grades.
const LOW_VARIANCE_CV: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Calibration {
    pub provider: String,
    pub inferred_budget: i64,
    /// `api`, `config`, or `calibrated`.
    pub source: &'static str,
    pub confidence: Confidence,
    pub sample_count: usize,
}

/// Infers a provider's weekly token budget from stored snapshots.
pub struct Calibrator {
    store: Arc<Store>,
    billing_mode: BillingMode,
    calibrate_enabled: bool,
    week_start_day: Weekday,
    fallback: FallbackBudgets,
}

#[derive(Debug, Clone)]
struct FallbackBudgets {
    weekly_tokens: i64,
    per_provider: std::collections::HashMap<String, i64>,
}

impl FallbackBudgets {
    fn budget(&self, provider: &str) -> i64 {
        self.per_provider
            .get(provider)
            .copied()
            .unwrap_or(self.weekly_tokens)
    }
}

impl Calibrator {
    pub fn new(store: Arc<Store>, config: &Config) -> Self {
        Self {
            store,
            billing_mode: config.budget.billing_mode,
            calibrate_enabled: config.budget.calibrate_enabled,
            week_start_day: config.budget.week_start_day.to_weekday(),
            fallback: FallbackBudgets {
                weekly_tokens: config.budget.weekly_tokens,
                per_provider: config.budget.per_provider.clone(),
            },
        }
    }

    /// The weekly budget the rest of the system should use.
    pub async fn budget(&self, provider: &str) -> Result<i64, StoreError> {
        Ok(self.calibrate(provider).await?.inferred_budget)
    }

    pub async fn calibrate(&self, provider: &str) -> Result<Calibration, StoreError> {
        let provider = provider.to_lowercase();
        let fallback = self.fallback.budget(&provider);

        // API billing has a known budget; nothing to infer.
        if self.billing_mode == BillingMode::Api {
            return Ok(Calibration {
                provider,
                inferred_budget: fallback,
                source: "api",
                confidence: Confidence::High,
                sample_count: 0,
            });
        }

        if !self.calibrate_enabled {
            return Ok(Calibration {
                provider,
                inferred_budget: fallback,
                source: "config",
                confidence: Confidence::None,
                sample_count: 0,
            });
        }

        let week_start = start_of_week(Utc::now(), self.week_start_day);
        let snapshots = self.store.snapshots_for_week(&provider, week_start).await?;

        let ratios: Vec<f64> = snapshots
            .iter()
            .filter_map(|s| {
                let pct = s.scraped_pct?;
                if pct > MIN_PCT && pct < MAX_PCT && s.local_tokens > 0 {
                    Some(s.local_tokens as f64 / (pct / 100.0))
                } else {
                    None
                }
            })
            .collect();

        let kept = reject_outliers(&ratios);
        if kept.is_empty() {
            return Ok(Calibration {
                provider,
                inferred_budget: fallback,
                source: "config",
                confidence: Confidence::None,
                sample_count: 0,
            });
        }

        let inferred = median(&kept).round() as i64;
        let confidence = grade(&kept);

        debug!(
            provider,
            inferred,
            samples = kept.len(),
            rejected = ratios.len() - kept.len(),
            confidence = confidence.as_str(),
            "calibration computed"
        );

        Ok(Calibration {
            provider,
            inferred_budget: inferred,
            source: "calibrated",
            confidence,
            sample_count: kept.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Statistics (pure)
// ---------------------------------------------------------------------------

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Keep samples within `MAD_FACTOR` median-absolute-deviations of the
/// median. With a zero MAD only samples equal to the median survive.
fn reject_outliers(values: &[f64]) -> Vec<f64> {
    if values.len() < 3 {
        return values.to_vec();
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations);
    values
        .iter()
        .copied()
        .filter(|v| (v - med).abs() <= MAD_FACTOR * mad)
        .collect()
}

fn grade(kept: &[f64]) -> Confidence {
    match kept.len() {
        0 => Confidence::None,
        1..=2 => Confidence::Low,
        n => {
            let low_variance = coefficient_of_variation(kept) <= LOW_VARIANCE_CV;
            if n <= 5 {
                if low_variance {
                    Confidence::Medium
                } else {
                    Confidence::Low
                }
            } else if low_variance {
                Confidence::High
            } else {
                Confidence::Medium
            }
        }
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let med = median(values);
    if med == 0.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / med
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Datelike, Local, Timelike, Utc};
    use ns_core::config::BudgetConfig;
    use ns_core::store::SnapshotRow;

    fn test_config(billing: BillingMode, enabled: bool, weekly: i64) -> Config {
        let mut cfg = Config::default();
        cfg.budget = BudgetConfig {
            billing_mode: billing,
            calibrate_enabled: enabled,
            weekly_tokens: weekly,
            ..BudgetConfig::default()
        };
        cfg
    }

    async fn insert_sample(
        store: &Store,
        provider: &str,
        local_tokens: i64,
        pct: f64,
        ts: DateTime<Utc>,
    ) {
        let week_start = start_of_week(ts, Weekday::Mon);
        let iso = week_start.with_timezone(&Local).date_naive().iso_week();
        store
            .insert_snapshot(&SnapshotRow {
                id: 0,
                provider: provider.into(),
                timestamp: ts,
                week_start,
                local_tokens,
                local_daily: 0,
                scraped_pct: Some(pct),
                inferred_budget: None,
                day_of_week: ts.with_timezone(&Local).weekday().num_days_from_sunday() as i64,
                hour_of_day: ts.with_timezone(&Local).hour() as i64,
                week_number: iso.week() as i64,
                year: iso.year() as i64,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn api_mode_returns_fallback_verbatim() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(store, &test_config(BillingMode::Api, true, 123_000));

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.source, "api");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.inferred_budget, 123_000);
    }

    #[tokio::test]
    async fn disabled_calibration_falls_back_to_config() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(
            store,
            &test_config(BillingMode::Subscription, false, 456_000),
        );

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.source, "config");
        assert_eq!(result.confidence, Confidence::None);
        assert_eq!(result.inferred_budget, 456_000);
    }

    #[tokio::test]
    async fn three_close_samples_calibrate_to_their_median() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(
            store.clone(),
            &test_config(BillingMode::Subscription, true, 700_000),
        );

        let now = Utc::now();
        insert_sample(&store, "claude", 300_000, 30.0, now).await;
        insert_sample(&store, "claude", 310_000, 30.0, now).await;
        insert_sample(&store, "claude", 290_000, 30.0, now).await;

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.source, "calibrated");
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(result.inferred_budget, 1_000_000);
        assert_eq!(result.sample_count, 3);
    }

    #[tokio::test]
    async fn mad_rejects_the_outlier() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(
            store.clone(),
            &test_config(BillingMode::Subscription, true, 700_000),
        );

        let now = Utc::now();
        insert_sample(&store, "claude", 100_000, 10.0, now).await;
        insert_sample(&store, "claude", 100_000, 10.0, now).await;
        insert_sample(&store, "claude", 1_000_000, 10.0, now).await;

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.inferred_budget, 1_000_000);
        assert_eq!(result.sample_count, 2);
    }

    #[tokio::test]
    async fn out_of_band_percentages_are_skipped() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(
            store.clone(),
            &test_config(BillingMode::Subscription, true, 700_000),
        );

        let now = Utc::now();
        insert_sample(&store, "claude", 100_000, 5.0, now).await; // at the edge: excluded
        insert_sample(&store, "claude", 100_000, 50.0, now).await;

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.sample_count, 1);
        assert_eq!(result.inferred_budget, 200_000);
    }

    #[tokio::test]
    async fn no_samples_means_config_fallback() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cal = Calibrator::new(
            store,
            &test_config(BillingMode::Subscription, true, 700_000),
        );

        let result = cal.calibrate("claude").await.unwrap();
        assert_eq!(result.source, "config");
        assert_eq!(result.confidence, Confidence::None);
        assert_eq!(result.inferred_budget, 700_000);
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&[1.0, 3.0, 2.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn an_in_band_sample_barely_moves_the_median() {
        let base = vec![1_000_000.0, 1_000_100.0, 999_900.0];
        let before = median(&reject_outliers(&base)).round();

        let mut with_extra = base.clone();
        with_extra.push(1_000_050.0); // within one MAD of the median
        let after = median(&reject_outliers(&with_extra)).round();

        assert!((before - after).abs() <= 75.0);
    }

    #[test]
    fn grade_scales_with_sample_count_and_variance() {
        assert_eq!(grade(&[1.0]), Confidence::Low);
        assert_eq!(grade(&[1.0, 1.0]), Confidence::Low);
        assert_eq!(grade(&[1.0, 1.0, 1.0]), Confidence::Medium);
        assert_eq!(grade(&[1.0; 6]), Confidence::High);
        // High variance drops a grade.
        assert_eq!(grade(&[1.0, 2.0, 3.0]), Confidence::Low);
        assert_eq!(grade(&[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]), Confidence::Medium);
    }
}
