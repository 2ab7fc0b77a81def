use std::io::{BufRead, IsTerminal, Write};

use ns_core::config::{parse_duration, Config};
use ns_daemon::orchestrator::TaskStatus;
use ns_daemon::{Runtime, RunOptions};

pub struct Flags {
    pub dry_run: bool,
    pub project: Option<String>,
    pub max_projects: usize,
    pub max_tasks: usize,
    pub timeout: Option<String>,
    pub yes: bool,
}

pub async fn run(config: Config, flags: Flags) -> anyhow::Result<()> {
    let timeout = match flags.timeout.as_deref() {
        Some(raw) => Some(parse_duration(raw)?),
        None => None,
    };
    let opts = RunOptions {
        project: flags.project,
        max_projects: flags.max_projects,
        max_tasks: flags.max_tasks,
        dry_run: flags.dry_run,
        timeout,
    };

    let runtime = Runtime::build(config).await?;

    // Preflight summary with confirmation in interactive terminals only.
    if !flags.dry_run && !flags.yes && std::io::stdin().is_terminal() {
        let planned = runtime.orchestrator.plan(&opts).await?;
        if planned.is_empty() {
            println!("Nothing to run: no project has both a viable provider and eligible tasks.");
            return Ok(());
        }
        println!("About to run:");
        for p in &planned {
            println!(
                "  {}  via {}  (allowance {} tokens)",
                p.project, p.provider, p.allowance
            );
            for task in &p.tasks {
                println!("    - {task}");
            }
        }
        print!("Proceed? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let summaries = runtime.orchestrator.run(&opts).await?;
    if summaries.is_empty() {
        println!("No projects processed.");
        return Ok(());
    }

    for summary in &summaries {
        let provider = summary.provider.as_deref().unwrap_or("-");
        println!(
            "{}  [{}]  provider={}  allowance={}",
            summary.project,
            summary.status.as_str(),
            provider,
            summary.allowance
        );
        for task in &summary.tasks {
            match (&task.status, &task.error) {
                (TaskStatus::Failed, Some(err)) => {
                    println!("  {}  {}  ({err})", task.task_type, task.status.as_str())
                }
                _ => println!("  {}  {}", task.task_type, task.status.as_str()),
            }
        }
    }
    Ok(())
}
