//! Drives one scheduled pass: resolve projects, pick a provider, select
//! tasks, invoke the agent, and persist outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ns_agents::{AgentProvider, ExecuteOptions};
use ns_budget::{Allowance, Manager};
use ns_core::config::Config;
use ns_core::projects::{self, ResolvedProject};
use ns_core::store::{canonical_project_path, RunRecord, RunStatus, Store};
use ns_tasks::selector::task_key;
use ns_tasks::{ScoredTask, Selector};
use tracing::{error, info, warn};

use crate::provider_select::{ProviderSelector, SelectError};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run only this project, bypassing discovery and the project cap.
    pub project: Option<String>,
    /// Cap on projects per pass when no explicit project is given.
    pub max_projects: usize,
    /// Cap on tasks per project.
    pub max_tasks: usize,
    /// Select but do not invoke; cooldowns must not advance.
    pub dry_run: bool,
    /// Per-invocation agent timeout override.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            project: None,
            max_projects: 1,
            max_tasks: 3,
            dry_run: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_type: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub project: String,
    pub provider: Option<String>,
    pub allowance: i64,
    pub tasks: Vec<TaskOutcome>,
    pub status: RunStatus,
}

/// A planned (not yet executed) pass, used for preflight display.
#[derive(Debug, Clone)]
pub struct PlannedProject {
    pub project: String,
    pub provider: String,
    pub allowance: i64,
    pub tasks: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<Store>,
    manager: Arc<Manager>,
    provider_selector: Arc<ProviderSelector>,
    agents: HashMap<String, Arc<dyn AgentProvider>>,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        manager: Arc<Manager>,
        provider_selector: Arc<ProviderSelector>,
        agents: HashMap<String, Arc<dyn AgentProvider>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            store,
            manager,
            provider_selector,
            agents,
            shutdown,
        }
    }

    /// Resolve the projects this pass would touch, honoring the cap.
    pub async fn resolve_projects(&self, opts: &RunOptions) -> anyhow::Result<Vec<ResolvedProject>> {
        if let Some(path) = &opts.project {
            return Ok(vec![ResolvedProject {
                path: canonical_project_path(path),
                priority: 0,
            }]);
        }

        let mut discovered = projects::discover(&self.config);
        let mut last_runs = HashMap::new();
        for p in self.store.list_projects().await? {
            if let Some(last) = p.last_run {
                last_runs.insert(p.path, last);
            }
        }
        projects::sort_for_run(&mut discovered, &last_runs);
        discovered.truncate(opts.max_projects.max(1));
        Ok(discovered)
    }

    /// Selection-only preview of a pass, for the preflight prompt.
    pub async fn plan(&self, opts: &RunOptions) -> anyhow::Result<Vec<PlannedProject>> {
        let mut planned = Vec::new();
        for project in self.resolve_projects(opts).await? {
            let Ok(provider) = self.provider_selector.select().await else {
                continue;
            };
            let allowance = self.manager.calculate_allowance(&provider).await?;
            if allowance.allowance == 0 {
                continue;
            }
            let selector = Selector::new(&self.config, self.store.clone());
            let tasks = selector
                .select_top_n(allowance.allowance, &project.path, opts.max_tasks)
                .await?;
            planned.push(PlannedProject {
                project: project.path,
                provider,
                allowance: allowance.allowance,
                tasks: tasks
                    .iter()
                    .map(|t| t.definition.task_type.to_string())
                    .collect(),
            });
        }
        Ok(planned)
    }

    /// Execute one pass over the resolved projects.
    pub async fn run(&self, opts: &RunOptions) -> anyhow::Result<Vec<RunSummary>> {
        let projects = self.resolve_projects(opts).await?;
        if projects.is_empty() {
            info!("no projects to process");
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for project in projects {
            if self.shutdown.is_shutting_down() {
                info!("shutdown requested, stopping pass");
                break;
            }

            let provider = match self.provider_selector.select().await {
                Ok(p) => p,
                Err(SelectError::NoneEnabled) => {
                    // Config-level problem; no project can do better.
                    return Err(SelectError::NoneEnabled.into());
                }
                Err(e) => {
                    warn!(project = %project.path, error = %e, "no viable provider");
                    summaries.push(RunSummary {
                        project: project.path.clone(),
                        provider: None,
                        allowance: 0,
                        tasks: Vec::new(),
                        status: RunStatus::Failed,
                    });
                    continue;
                }
            };

            let allowance = self.manager.calculate_allowance(&provider).await?;
            if allowance.allowance == 0 {
                info!(project = %project.path, provider = %provider, "allowance is zero, skipping project");
                continue;
            }

            let summary = self
                .run_project(&project.path, &provider, &allowance, opts)
                .await?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    async fn run_project(
        &self,
        project: &str,
        provider: &str,
        allowance: &Allowance,
        opts: &RunOptions,
    ) -> anyhow::Result<RunSummary> {
        let start_time = Utc::now();
        let selector = Selector::new(&self.config, self.store.clone());
        let tasks = selector
            .select_top_n(allowance.allowance, project, opts.max_tasks)
            .await?;

        info!(
            project,
            provider,
            allowance = allowance.allowance,
            tasks = tasks.len(),
            dry_run = opts.dry_run,
            "starting project pass"
        );

        let mut outcomes = Vec::new();
        for task in &tasks {
            if self.shutdown.is_shutting_down() {
                break;
            }
            if opts.dry_run {
                outcomes.push(TaskOutcome {
                    task_type: task.definition.task_type.to_string(),
                    status: TaskStatus::Skipped,
                    error: None,
                });
                continue;
            }
            outcomes.push(self.run_task(project, provider, task, opts).await);
        }

        let status = run_status(&outcomes);
        if !opts.dry_run {
            let tokens_used: i64 = outcomes
                .iter()
                .zip(&tasks)
                .filter(|(o, _)| o.status == TaskStatus::Completed)
                .map(|(_, t)| t.definition.cost_tier.min_tokens())
                .sum();
            let error = outcomes
                .iter()
                .find_map(|o| o.error.clone());

            self.store
                .append_run(&RunRecord {
                    id: 0,
                    start_time,
                    end_time: Some(Utc::now()),
                    project: project.to_string(),
                    tasks: serde_json::to_string(
                        &outcomes
                            .iter()
                            .map(|o| {
                                serde_json::json!({
                                    "task_type": o.task_type,
                                    "status": o.status.as_str(),
                                })
                            })
                            .collect::<Vec<_>>(),
                    )
                    .ok(),
                    tokens_used,
                    status,
                    error,
                })
                .await?;
            self.store.record_project_run(project).await?;
        }

        Ok(RunSummary {
            project: project.to_string(),
            provider: Some(provider.to_string()),
            allowance: allowance.allowance,
            tasks: outcomes,
            status,
        })
    }

    /// Claim, invoke, record, release. The task-run record advances the
    /// cooldown on any outcome; the claim is cleared on every exit path.
    async fn run_task(
        &self,
        project: &str,
        provider: &str,
        task: &ScoredTask,
        opts: &RunOptions,
    ) -> TaskOutcome {
        let task_type = task.definition.task_type.clone();
        let key = task_key(&task_type, project);

        match self.store.mark_assigned(&key, project, task_type.as_str()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%task_type, project, "task already claimed elsewhere");
                return TaskOutcome {
                    task_type: task_type.to_string(),
                    status: TaskStatus::Skipped,
                    error: None,
                };
            }
            Err(e) => {
                error!(%task_type, project, error = %e, "claim failed");
                return TaskOutcome {
                    task_type: task_type.to_string(),
                    status: TaskStatus::Failed,
                    error: Some(e.to_string()),
                };
            }
        }

        let outcome = match self.agents.get(provider) {
            Some(agent) => {
                let result = agent
                    .execute(ExecuteOptions {
                        prompt: task.definition.description.clone(),
                        work_dir: project.into(),
                        files: Vec::new(),
                        timeout: opts.timeout,
                    })
                    .await;
                match result {
                    Ok(res) if res.succeeded() => {
                        info!(%task_type, project, duration_ms = res.duration.as_millis() as u64, "task completed");
                        TaskOutcome {
                            task_type: task_type.to_string(),
                            status: TaskStatus::Completed,
                            error: None,
                        }
                    }
                    Ok(res) => {
                        warn!(%task_type, project, exit_code = res.exit_code, "task failed");
                        TaskOutcome {
                            task_type: task_type.to_string(),
                            status: TaskStatus::Failed,
                            error: Some(format!("exit code {}", res.exit_code)),
                        }
                    }
                    Err(e) => {
                        warn!(%task_type, project, error = %e, "task errored");
                        TaskOutcome {
                            task_type: task_type.to_string(),
                            status: TaskStatus::Failed,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            None => TaskOutcome {
                task_type: task_type.to_string(),
                status: TaskStatus::Failed,
                error: Some(format!("no agent wired for provider {provider}")),
            },
        };

        // Completion of any kind advances the cooldown.
        if let Err(e) = self.store.record_task_run(project, task_type.as_str()).await {
            error!(%task_type, project, error = %e, "failed to record task run");
        }
        if let Err(e) = self.store.clear_assigned(&key).await {
            error!(%task_type, project, error = %e, "failed to clear assignment");
        }

        outcome
    }
}

fn run_status(outcomes: &[TaskOutcome]) -> RunStatus {
    let completed = outcomes
        .iter()
        .filter(|o| o.status == TaskStatus::Completed)
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| o.status == TaskStatus::Failed)
        .count();
    if failed == 0 {
        RunStatus::Success
    } else if completed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}
