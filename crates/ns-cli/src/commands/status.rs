use ns_core::config::Config;
use ns_core::stats;
use ns_daemon::Runtime;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let runtime = Runtime::build(config).await?;

    let projects = runtime.store.list_projects().await?;
    if projects.is_empty() {
        println!("No projects recorded yet. Configure [projects] and run `nightshift run`.");
    } else {
        println!("Projects:");
        for p in &projects {
            let last = p
                .last_run
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".into());
            println!("  {}  runs={}  last={last}", p.path, p.run_count);
        }
    }

    let runs = runtime.store.list_runs(5).await?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for r in runs {
            println!(
                "  {}  {}  [{}]  tokens={}",
                r.start_time.format("%Y-%m-%d %H:%M"),
                r.project,
                r.status.as_str(),
                r.tokens_used
            );
        }
    }

    let result = stats::compute(&runtime.store).await?;
    println!(
        "\nTotals: {} runs, {} tokens ({} avg/run)",
        result.total_runs, result.total_tokens_used, result.avg_tokens_per_run
    );
    if let Some(proj) = result.budget_projection {
        println!(
            "Budget projection ({}): weekly={} used={:.0}% avg_daily={} est_days_remaining={}",
            proj.provider,
            proj.weekly_budget,
            proj.current_used_pct,
            proj.avg_daily_usage,
            proj.est_days_remaining
        );
    }

    for provider in runtime.collector.providers() {
        let averages = runtime.store.hourly_averages(provider, 30).await?;
        if let Some(peak) = averages.iter().max_by(|a, b| {
            a.avg_daily_tokens
                .partial_cmp(&b.avg_daily_tokens)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            println!(
                "{provider}: heaviest hour {:02}:00 (~{} tokens/day on average)",
                peak.hour, peak.avg_daily_tokens as i64
            );
        }
    }

    let assigned = runtime.store.list_assigned().await?;
    if !assigned.is_empty() {
        println!("\nIn-flight claims:");
        for a in assigned {
            println!("  {}  since {}", a.key, a.assigned_at.format("%Y-%m-%d %H:%M"));
        }
    }

    Ok(())
}
