//! Preference-ordered provider selection.

use std::collections::HashMap;
use std::sync::Arc;

use ns_agents::AgentProvider;
use ns_budget::Manager;
use ns_core::config::Config;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no providers enabled in config")]
    NoneEnabled,
    #[error("{0} CLI not in PATH")]
    CliNotFound(String),
    #[error("budget exhausted for all providers")]
    BudgetExhausted,
}

/// Walks the configured preference list and returns the first enabled
/// provider whose CLI is on PATH and whose allowance is non-zero.
pub struct ProviderSelector {
    preference: Vec<String>,
    enabled: HashMap<String, bool>,
    agents: HashMap<String, Arc<dyn AgentProvider>>,
    manager: Arc<Manager>,
}

impl ProviderSelector {
    pub fn new(
        config: &Config,
        agents: HashMap<String, Arc<dyn AgentProvider>>,
        manager: Arc<Manager>,
    ) -> Self {
        let enabled = ["claude", "codex", "gemini"]
            .into_iter()
            .map(|name| {
                let on = config.provider(name).map(|p| p.enabled).unwrap_or(false);
                (name.to_string(), on)
            })
            .collect();
        Self {
            preference: config.provider_preference(),
            enabled,
            agents,
            manager,
        }
    }

    /// Pick a provider for the next run.
    pub async fn select(&self) -> Result<String, SelectError> {
        let mut saw_enabled = false;
        let mut missing_cli: Option<String> = None;
        let mut saw_on_path = false;

        for name in &self.preference {
            if !self.enabled.get(name).copied().unwrap_or(false) {
                continue;
            }
            saw_enabled = true;

            let Some(agent) = self.agents.get(name) else {
                continue;
            };
            if !agent.available() {
                debug!(provider = %name, "CLI not on PATH");
                missing_cli.get_or_insert_with(|| name.clone());
                continue;
            }
            saw_on_path = true;

            match self.manager.calculate_allowance(name).await {
                Ok(allowance) if allowance.allowance > 0 => {
                    debug!(provider = %name, allowance = allowance.allowance, "provider selected");
                    return Ok(name.clone());
                }
                Ok(_) => {
                    debug!(provider = %name, "allowance exhausted");
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "allowance check failed");
                }
            }
        }

        if !saw_enabled {
            Err(SelectError::NoneEnabled)
        } else if !saw_on_path {
            // Every enabled provider was missing its CLI; name the first.
            Err(SelectError::CliNotFound(
                missing_cli.unwrap_or_else(|| "provider".into()),
            ))
        } else {
            Err(SelectError::BudgetExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ns_agents::{
        BudgetRelativeUsage, ExecuteOptions, ExecuteResult, UsageProbe,
    };
    use ns_budget::BudgetSource;
    use ns_core::config::{BudgetMode, BudgetConfig};

    struct FakeAgent {
        name: &'static str,
        on_path: bool,
    }

    #[async_trait]
    impl AgentProvider for FakeAgent {
        fn name(&self) -> &'static str {
            self.name
        }
        fn binary(&self) -> &str {
            self.name
        }
        fn available(&self) -> bool {
            self.on_path
        }
        async fn execute(&self, _opts: ExecuteOptions) -> ns_agents::Result<ExecuteResult> {
            Ok(ExecuteResult::default())
        }
    }

    struct FixedUsage {
        name: &'static str,
        pct: f64,
    }

    impl BudgetRelativeUsage for FixedUsage {
        fn name(&self) -> &'static str {
            self.name
        }
        fn used_percent(&self, _mode: BudgetMode, _weekly: i64) -> ns_agents::Result<f64> {
            Ok(self.pct)
        }
        fn weekly_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
        fn today_tokens(&self) -> ns_agents::Result<i64> {
            Ok(0)
        }
    }

    struct FixedBudget;

    #[async_trait]
    impl BudgetSource for FixedBudget {
        async fn weekly_budget(&self, _provider: &str) -> ns_budget::engine::Result<i64> {
            Ok(700_000)
        }
    }

    fn setup(
        claude_pct: f64,
        codex_pct: f64,
        claude_on_path: bool,
        codex_on_path: bool,
        preference: Vec<&str>,
    ) -> ProviderSelector {
        let mut cfg = Config::default();
        cfg.providers.preference = preference.into_iter().map(String::from).collect();
        cfg.providers.claude.enabled = true;
        cfg.providers.codex.enabled = true;
        cfg.providers.gemini.enabled = false;
        cfg.budget = BudgetConfig {
            mode: BudgetMode::Daily,
            max_percent: 75,
            reserve_percent: 0,
            ..BudgetConfig::default()
        };

        let probes = HashMap::from([
            (
                "claude".to_string(),
                UsageProbe::BudgetRelative(Arc::new(FixedUsage {
                    name: "claude",
                    pct: claude_pct,
                })),
            ),
            (
                "codex".to_string(),
                UsageProbe::BudgetRelative(Arc::new(FixedUsage {
                    name: "codex",
                    pct: codex_pct,
                })),
            ),
        ]);
        let manager = Arc::new(Manager::new(&cfg, Arc::new(FixedBudget), probes));

        let agents: HashMap<String, Arc<dyn AgentProvider>> = HashMap::from([
            (
                "claude".to_string(),
                Arc::new(FakeAgent {
                    name: "claude",
                    on_path: claude_on_path,
                }) as Arc<dyn AgentProvider>,
            ),
            (
                "codex".to_string(),
                Arc::new(FakeAgent {
                    name: "codex",
                    on_path: codex_on_path,
                }) as Arc<dyn AgentProvider>,
            ),
        ]);

        ProviderSelector::new(&cfg, agents, manager)
    }

    #[tokio::test]
    async fn falls_back_when_preferred_provider_is_exhausted() {
        // Codex is preferred but fully used; Claude is untouched.
        let sel = setup(0.0, 100.0, true, true, vec!["codex", "claude"]);
        assert_eq!(sel.select().await.unwrap(), "claude");
    }

    #[tokio::test]
    async fn preference_order_wins_when_both_have_budget() {
        let sel = setup(0.0, 0.0, true, true, vec!["codex", "claude"]);
        assert_eq!(sel.select().await.unwrap(), "codex");
    }

    #[tokio::test]
    async fn nothing_enabled_is_distinguishable() {
        let mut cfg = Config::default();
        cfg.providers.claude.enabled = false;
        cfg.providers.codex.enabled = false;
        cfg.providers.gemini.enabled = false;
        let manager = Arc::new(Manager::new(
            &cfg,
            Arc::new(FixedBudget),
            HashMap::new(),
        ));
        let sel = ProviderSelector::new(&cfg, HashMap::new(), manager);
        assert!(matches!(sel.select().await, Err(SelectError::NoneEnabled)));
    }

    #[tokio::test]
    async fn missing_cli_is_distinguishable() {
        let sel = setup(0.0, 0.0, false, false, vec!["codex", "claude"]);
        match sel.select().await {
            Err(SelectError::CliNotFound(name)) => assert_eq!(name, "codex"),
            other => panic!("expected CliNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_everywhere_is_distinguishable() {
        let sel = setup(100.0, 100.0, true, true, vec!["codex", "claude"]);
        assert!(matches!(sel.select().await, Err(SelectError::BudgetExhausted)));
    }
}
