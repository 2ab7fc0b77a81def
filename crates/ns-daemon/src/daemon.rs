//! Long-lived background loops: the optional main-run tick and the
//! always-on snapshot ticker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use ns_budget::Collector;
use ns_core::config::Config;
use tracing::{error, info, warn};

use crate::orchestrator::{Orchestrator, RunOptions};
use crate::shutdown::ShutdownSignal;

/// Claims older than this are swept at daemon startup.
const STALE_ASSIGNMENT_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub snapshot: Duration,
    /// Main-run interval; `None` when runs are driven by an OS timer.
    pub run: Option<Duration>,
}

/// The nightshift background daemon.
///
/// The snapshot ticker accumulates calibration evidence around the clock
/// regardless of whether a main run is active; recoverable errors are
/// absorbed per tick so one bad cycle never kills the loop.
pub struct Daemon {
    config: Config,
    collector: Arc<Collector>,
    orchestrator: Arc<Orchestrator>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(
        config: Config,
        collector: Arc<Collector>,
        orchestrator: Arc<Orchestrator>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let intervals = DaemonIntervals {
            snapshot: config.snapshot_interval(),
            run: config.run_interval(),
        };
        Self {
            config,
            collector,
            orchestrator,
            intervals,
            shutdown,
        }
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the daemon loops until shutdown (blocking).
    pub async fn run(&self, store: &ns_core::store::Store) -> anyhow::Result<()> {
        // A crashed run leaves claim rows behind; sweep them before looping.
        let swept = store.clear_stale_assignments(STALE_ASSIGNMENT_AGE).await?;
        if swept > 0 {
            warn!(swept, "cleared stale assignments from a previous run");
        }

        info!(
            snapshot_secs = self.intervals.snapshot.as_secs(),
            run_secs = self.intervals.run.map(|d| d.as_secs()),
            "daemon starting event loop"
        );

        let mut snapshot_tick = tokio::time::interval(self.intervals.snapshot);
        // Runs tick on their own interval, or never when cron/OS-driven.
        let mut run_tick = tokio::time::interval(
            self.intervals.run.unwrap_or(Duration::from_secs(3600)),
        );

        // Consume the immediate first ticks so loops don't all fire at t=0.
        snapshot_tick.tick().await;
        run_tick.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();
        let retention_days = self.config.budget.retention_days;

        loop {
            tokio::select! {
                _ = snapshot_tick.tick() => {
                    let rows = self.collector.take_all().await;
                    info!(snapshots = rows.len(), "snapshot tick complete");
                    match self.collector.prune(retention_days).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "pruned old snapshots"),
                        Err(e) => error!(error = %e, "snapshot prune failed"),
                    }
                }
                _ = run_tick.tick(), if self.intervals.run.is_some() => {
                    if !self.within_window() {
                        info!("outside run window, skipping scheduled run");
                        continue;
                    }
                    let opts = RunOptions::default();
                    match self.orchestrator.run(&opts).await {
                        Ok(summaries) => {
                            info!(projects = summaries.len(), "scheduled run complete");
                        }
                        Err(e) => {
                            // One bad run must not kill the daemon.
                            error!(error = %e, "scheduled run failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping daemon loops");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Whether the current local time falls inside the configured run
    /// window. No window means always.
    fn within_window(&self) -> bool {
        let Some(window) = &self.config.schedule.window else {
            return true;
        };
        let (Some(start), Some(end)) = (parse_hhmm(&window.start), parse_hhmm(&window.end))
        else {
            warn!("unparseable run window, running anyway");
            return true;
        };

        let now = Local::now().time();
        let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
        if start <= end {
            now >= start && now < end
        } else {
            // Overnight window, e.g. 22:00 - 06:00.
            now >= start || now < end
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_times() {
        assert_eq!(parse_hhmm("02:30"), NaiveTime::from_hms_opt(2, 30, 0));
        assert_eq!(parse_hhmm(" 23:00 "), NaiveTime::from_hms_opt(23, 0, 0));
        assert!(parse_hhmm("2pm").is_none());
    }
}
