//! Composition root: builds the store, probes, budget engine, collector,
//! and orchestrator from a loaded configuration.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use ns_agents::claude::{ClaudeAgent, ClaudeUsage};
use ns_agents::codex::{CodexAgent, CodexUsage};
use ns_agents::gemini::{GeminiAgent, GeminiUsage};
use ns_agents::{AgentProvider, UsageProbe};
use ns_budget::{Calibrator, Collector, Manager};
use ns_core::config::Config;
use ns_core::store::Store;
use ns_tasks::registry;

use crate::daemon::Daemon;
use crate::orchestrator::Orchestrator;
use crate::provider_select::ProviderSelector;
use crate::shutdown::ShutdownSignal;
use crate::usage_scrape::TmuxUsageScraper;

/// Everything a command needs, wired once.
pub struct Runtime {
    pub config: Config,
    pub store: Arc<Store>,
    pub calibrator: Arc<Calibrator>,
    pub manager: Arc<Manager>,
    pub collector: Arc<Collector>,
    pub provider_selector: Arc<ProviderSelector>,
    pub orchestrator: Arc<Orchestrator>,
    pub shutdown: ShutdownSignal,
}

impl Runtime {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        registry::register_custom_tasks(&config.tasks.custom)
            .context("registering custom tasks")?;

        let store = Arc::new(
            Store::open(config.db_path())
                .await
                .context("opening database")?,
        );

        let mut agents: HashMap<String, Arc<dyn AgentProvider>> = HashMap::new();
        let mut probes_by_name: HashMap<String, UsageProbe> = HashMap::new();
        let mut probe_list: Vec<UsageProbe> = Vec::new();

        if config.providers.claude.enabled {
            let agent = ClaudeAgent::new()
                .with_skip_permissions(config.providers.claude.yolo);
            agents.insert("claude".into(), Arc::new(agent));

            let usage = match config.providers.claude.expanded_data_path() {
                Some(path) => ClaudeUsage::with_path(path),
                None => ClaudeUsage::default(),
            };
            let probe = UsageProbe::BudgetRelative(Arc::new(usage));
            probes_by_name.insert("claude".into(), probe.clone());
            probe_list.push(probe);
        }

        if config.providers.codex.enabled {
            let agent = CodexAgent::new().with_full_auto(config.providers.codex.yolo);
            agents.insert("codex".into(), Arc::new(agent));

            let usage = match config.providers.codex.expanded_data_path() {
                Some(path) => CodexUsage::with_path(path),
                None => CodexUsage::default(),
            };
            let probe = UsageProbe::SelfReporting(Arc::new(usage));
            probes_by_name.insert("codex".into(), probe.clone());
            probe_list.push(probe);
        }

        if config.providers.gemini.enabled {
            let agent = GeminiAgent::new().with_yolo(config.providers.gemini.yolo);
            agents.insert("gemini".into(), Arc::new(agent));

            let usage = match config.providers.gemini.expanded_data_path() {
                Some(path) => GeminiUsage::with_path(path),
                None => GeminiUsage::default(),
            };
            let probe = UsageProbe::BudgetRelative(Arc::new(usage));
            probes_by_name.insert("gemini".into(), probe.clone());
            probe_list.push(probe);
        }

        let calibrator = Arc::new(Calibrator::new(store.clone(), &config));
        let manager = Arc::new(Manager::new(
            &config,
            calibrator.clone(),
            probes_by_name,
        ));
        let collector = Arc::new(Collector::new(
            store.clone(),
            probe_list,
            Some(Arc::new(TmuxUsageScraper::new())),
            config.budget.week_start_day.to_weekday(),
        ));

        let shutdown = ShutdownSignal::new();
        let provider_selector = Arc::new(ProviderSelector::new(
            &config,
            agents.clone(),
            manager.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            store.clone(),
            manager.clone(),
            provider_selector.clone(),
            agents,
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            store,
            calibrator,
            manager,
            collector,
            provider_selector,
            orchestrator,
            shutdown,
        })
    }

    pub fn daemon(&self) -> Daemon {
        Daemon::new(
            self.config.clone(),
            self.collector.clone(),
            self.orchestrator.clone(),
            self.shutdown.clone(),
        )
    }
}
