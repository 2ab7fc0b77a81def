use std::path::PathBuf;

use anyhow::Context;
use ns_core::config::Config;

const DEFAULT_CONFIG: &str = r#"# nightshift configuration

[schedule]
# Exactly one of cron (for OS timers) or interval (for the daemon loop).
interval = "24h"
# window = { start = "01:00", end = "06:00" }

[budget]
mode = "daily"              # daily | weekly
max_percent = 50
reserve_percent = 10
billing_mode = "subscription"
calibrate_enabled = true
snapshot_interval = "30m"
weekly_tokens = 500000
week_start_day = "monday"
aggressive_end_of_week = false

[providers]
preference = ["claude", "codex", "gemini"]

[providers.claude]
enabled = true

[providers.codex]
enabled = false

[providers.gemini]
enabled = false

[tasks]
enabled = []                # empty = all non-experimental tasks
disabled = []

# [[projects]]
# path = "~/src/my-project"
# priority = 5

# [[projects]]
# pattern = "~/src/*"
# exclude = ["~/src/scratch"]

[logging]
level = "info"
format = "text"
"#;

pub fn run(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(Config::default_path);
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating config directory")?;
    }
    std::fs::write(&path, DEFAULT_CONFIG).context("writing config")?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
