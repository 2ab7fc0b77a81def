use clap::Subcommand;
use ns_core::config::Config;
use ns_daemon::Runtime;

#[derive(Subcommand)]
pub enum BudgetCommands {
    /// Capture a usage snapshot for enabled providers.
    Snapshot {
        /// Snapshot a single provider (claude, codex, gemini).
        #[arg(short, long)]
        provider: Option<String>,
    },
    /// Show recent snapshots.
    History {
        #[arg(short, long)]
        provider: Option<String>,
        /// Number of snapshots to show.
        #[arg(short, default_value_t = 20)]
        n: i64,
    },
    /// Show inferred-budget calibration status.
    Calibrate {
        #[arg(short, long)]
        provider: Option<String>,
    },
}

pub async fn run(config: Config, command: Option<BudgetCommands>) -> anyhow::Result<()> {
    let runtime = Runtime::build(config).await?;

    match command {
        None => show_allowances(&runtime).await,
        Some(BudgetCommands::Snapshot { provider }) => snapshot(&runtime, provider).await,
        Some(BudgetCommands::History { provider, n }) => history(&runtime, provider, n).await,
        Some(BudgetCommands::Calibrate { provider }) => calibrate(&runtime, provider).await,
    }
}

fn providers(runtime: &Runtime, filter: Option<String>) -> Vec<String> {
    match filter {
        Some(p) => vec![p.to_lowercase()],
        None => runtime
            .collector
            .providers()
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

async fn show_allowances(runtime: &Runtime) -> anyhow::Result<()> {
    for provider in providers(runtime, None) {
        match runtime.manager.calculate_allowance(&provider).await {
            Ok(allowance) => println!("{}", allowance.summary(&provider)),
            Err(e) => println!("{provider}: {e}"),
        }
    }
    Ok(())
}

async fn snapshot(runtime: &Runtime, provider: Option<String>) -> anyhow::Result<()> {
    for provider in providers(runtime, provider) {
        match runtime.collector.take_snapshot(&provider).await {
            Ok(row) => {
                let pct = row
                    .scraped_pct
                    .map(|p| format!("{p:.0}%"))
                    .unwrap_or_else(|| "-".into());
                let inferred = row
                    .inferred_budget
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{provider}: weekly={} today={} scraped={pct} inferred={inferred}",
                    row.local_tokens, row.local_daily
                );
            }
            Err(e) => println!("{provider}: snapshot failed: {e}"),
        }
    }
    Ok(())
}

async fn history(runtime: &Runtime, provider: Option<String>, n: i64) -> anyhow::Result<()> {
    for provider in providers(runtime, provider) {
        let snapshots = runtime.collector.latest(&provider, n).await?;
        if snapshots.is_empty() {
            println!("{provider}: no snapshots");
            continue;
        }
        println!("{provider}:");
        for s in snapshots {
            let pct = s
                .scraped_pct
                .map(|p| format!("{p:.0}%"))
                .unwrap_or_else(|| "-".into());
            let inferred = s
                .inferred_budget
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  {}  weekly={}  today={}  scraped={pct}  inferred={inferred}",
                s.timestamp.format("%Y-%m-%d %H:%M"),
                s.local_tokens,
                s.local_daily
            );
        }
    }
    Ok(())
}

async fn calibrate(runtime: &Runtime, provider: Option<String>) -> anyhow::Result<()> {
    for provider in providers(runtime, provider) {
        let result = runtime.calibrator.calibrate(&provider).await?;
        println!(
            "{provider}: budget={} source={} confidence={} samples={}",
            result.inferred_budget,
            result.source,
            result.confidence.as_str(),
            result.sample_count
        );
    }
    Ok(())
}
