//! Aggregate statistics over run history, projects, and snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{Result, Store};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsResult {
    pub total_runs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_tokens_used: i64,
    pub avg_tokens_per_run: i64,
    pub total_projects: i64,
    pub project_breakdown: Vec<ProjectStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_projection: Option<BudgetProjection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub name: String,
    pub run_count: i64,
}

/// Estimate of remaining budget runway derived from snapshot data.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetProjection {
    pub provider: String,
    pub weekly_budget: i64,
    pub current_used_pct: f64,
    pub avg_daily_usage: i64,
    pub est_days_remaining: i64,
    pub source: String,
}

/// Compute aggregate statistics from the store.
pub async fn compute(store: &Store) -> Result<StatsResult> {
    let totals = store.run_totals().await?;
    let mut result = StatsResult {
        total_runs: totals.count,
        first_run_at: totals.first_run,
        last_run_at: totals.last_run,
        total_tokens_used: totals.total_tokens,
        ..StatsResult::default()
    };
    if result.total_runs > 0 {
        result.avg_tokens_per_run = result.total_tokens_used / result.total_runs;
    }

    let projects = store.list_projects().await?;
    result.total_projects = projects.len() as i64;
    result.project_breakdown = projects
        .iter()
        .map(|p| ProjectStats {
            name: base_name(&p.path),
            run_count: p.run_count,
        })
        .collect();
    result
        .project_breakdown
        .sort_by(|a, b| b.run_count.cmp(&a.run_count).then_with(|| a.name.cmp(&b.name)));

    result.budget_projection = compute_projection(store).await?;
    Ok(result)
}

/// Latest inferred budget plus average daily usage over the trailing week,
/// turned into an estimated-days-remaining figure.
async fn compute_projection(store: &Store) -> Result<Option<BudgetProjection>> {
    let Some(snapshot) = store.latest_inferred_snapshot().await? else {
        return Ok(None);
    };
    let Some(weekly_budget) = snapshot.inferred_budget.filter(|b| *b > 0) else {
        return Ok(None);
    };

    let Some(avg_daily) = store.avg_daily_usage(&snapshot.provider, 7).await? else {
        return Ok(None);
    };
    if avg_daily <= 0.0 {
        return Ok(None);
    }

    let used_pct = snapshot.scraped_pct.unwrap_or(0.0);
    let remaining = weekly_budget as f64 * (1.0 - used_pct / 100.0);
    let est_days = if remaining > 0.0 {
        (remaining / avg_daily) as i64
    } else {
        0
    };

    Ok(Some(BudgetProjection {
        provider: snapshot.provider,
        weekly_budget,
        current_used_pct: used_pct,
        avg_daily_usage: avg_daily as i64,
        est_days_remaining: est_days,
        source: "calibrated".into(),
    }))
}

fn base_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
