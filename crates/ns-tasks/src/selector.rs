//! Priority-scoring task selection per project.
//!
//! Candidates flow through a fixed filtering pipeline (enabled -> budget ->
//! unassigned -> cooldown) and are ranked by an additive score. Ties fall
//! back to the registry's sorted order, so results are deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ns_core::config::Config;
use ns_core::store::{canonical_project_path, Store, StoreError};
use tracing::debug;

use crate::definitions::{TaskDefinition, TaskType};
use crate::registry;

/// Score bonus for a task never run on the project.
const STALENESS_MAX: f64 = 3.0;
/// Score bonus when the project's context hints mention the task type.
const CONTEXT_BONUS: f64 = 2.0;
/// Score bonus when an external task source surfaced the type.
const SOURCE_BONUS: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct ScoredTask {
    pub definition: TaskDefinition,
    pub score: f64,
}

/// Scores and ranks tasks for one run. Context mentions and task sources are
/// set once per run before selection begins.
pub struct Selector {
    store: Arc<Store>,
    enabled: Vec<String>,
    disabled: Vec<String>,
    priorities: HashMap<String, i64>,
    intervals: HashMap<String, Duration>,
    context_mentions: Vec<String>,
    task_sources: Vec<String>,
}

impl Selector {
    pub fn new(config: &Config, store: Arc<Store>) -> Self {
        let intervals = config
            .tasks
            .intervals
            .keys()
            .filter_map(|t| config.task_interval(t).map(|d| (t.clone(), d)))
            .collect();
        Self {
            store,
            enabled: config.tasks.enabled.clone(),
            disabled: config.tasks.disabled.clone(),
            priorities: config.tasks.priorities.clone(),
            intervals,
            context_mentions: Vec::new(),
            task_sources: Vec::new(),
        }
    }

    /// Task types mentioned in the project's context hints.
    pub fn set_context_mentions(&mut self, mentions: Vec<String>) {
        self.context_mentions = mentions;
    }

    /// Task types surfaced by an external source (e.g. an issue feed).
    pub fn set_task_sources(&mut self, sources: Vec<String>) {
        self.task_sources = sources;
    }

    // -----------------------------------------------------------------------
    // Filtering pipeline
    // -----------------------------------------------------------------------

    /// Apply the enable/disable lists. An explicit enabled list keeps only
    /// its members; otherwise everything not disabled-by-default is kept.
    /// The disabled list always wins.
    pub fn filter_enabled(&self, tasks: Vec<TaskDefinition>) -> Vec<TaskDefinition> {
        tasks
            .into_iter()
            .filter(|def| {
                let t = def.task_type.as_str();
                if self.disabled.iter().any(|d| d == t) {
                    return false;
                }
                if self.enabled.is_empty() {
                    !def.disabled_by_default
                } else {
                    self.enabled.iter().any(|e| e == t)
                }
            })
            .collect()
    }

    /// Keep tasks whose cost-tier lower bound fits the remaining budget.
    pub fn filter_by_budget(
        &self,
        tasks: Vec<TaskDefinition>,
        budget: i64,
    ) -> Vec<TaskDefinition> {
        tasks
            .into_iter()
            .filter(|def| def.cost_tier.min_tokens() < budget)
            .collect()
    }

    /// Drop tasks with an active assignment for this project.
    pub async fn filter_unassigned(
        &self,
        tasks: Vec<TaskDefinition>,
        project: &str,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        let mut out = Vec::with_capacity(tasks.len());
        for def in tasks {
            let key = task_key(&def.task_type, project);
            if !self.store.is_assigned(&key).await? {
                out.push(def);
            }
        }
        Ok(out)
    }

    /// Drop tasks still inside their per-type cooldown for this project.
    pub async fn filter_cooldown(
        &self,
        tasks: Vec<TaskDefinition>,
        project: &str,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(tasks.len());
        for def in tasks {
            let interval = self
                .intervals
                .get(def.task_type.as_str())
                .copied()
                .unwrap_or(def.default_cooldown);
            let eligible = match self.store.last_task_run(project, def.task_type.as_str()).await? {
                None => true,
                Some(last) => {
                    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                    elapsed >= interval
                }
            };
            if eligible {
                out.push(def);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Scoring
    // -----------------------------------------------------------------------

    /// Score one task for a project (higher wins).
    pub async fn score_task(
        &self,
        task_type: &TaskType,
        project: &str,
    ) -> Result<f64, StoreError> {
        let priority = self
            .priorities
            .get(task_type.as_str())
            .copied()
            .unwrap_or(0) as f64;

        let staleness = self.staleness_bonus(task_type, project).await?;

        let t = task_type.as_str();
        let context = if self.context_mentions.iter().any(|m| m == t) {
            CONTEXT_BONUS
        } else {
            0.0
        };
        let source = if self.task_sources.iter().any(|s| s == t) {
            SOURCE_BONUS
        } else {
            0.0
        };

        Ok(priority + staleness + context + source)
    }

    /// Additive bonus favoring tasks not recently run on the project:
    /// never run scores the maximum, a run today scores zero, with discrete
    /// tiers in between keyed by the whole-day delta.
    pub async fn staleness_bonus(
        &self,
        task_type: &TaskType,
        project: &str,
    ) -> Result<f64, StoreError> {
        let Some(last) = self.store.last_task_run(project, task_type.as_str()).await? else {
            return Ok(STALENESS_MAX);
        };
        let days = (Utc::now() - last).num_days();
        Ok(match days {
            d if d <= 0 => 0.0,
            1..=3 => 1.0,
            4..=7 => 2.0,
            _ => STALENESS_MAX,
        })
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Up to `n` candidates sorted by score descending. Ties keep the
    /// registry's sorted order.
    pub async fn select_top_n(
        &self,
        budget: i64,
        project: &str,
        n: usize,
    ) -> Result<Vec<ScoredTask>, StoreError> {
        let candidates = self.filter_enabled(registry::all_definitions_sorted());
        let candidates = self.filter_by_budget(candidates, budget);
        let candidates = self.filter_unassigned(candidates, project).await?;
        let candidates = self.filter_cooldown(candidates, project).await?;

        let mut scored = Vec::with_capacity(candidates.len());
        for def in candidates {
            let score = self.score_task(&def.task_type, project).await?;
            scored.push(ScoredTask {
                definition: def,
                score,
            });
        }
        // Stable sort preserves registry order among equal scores.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(n);

        debug!(
            project,
            budget,
            candidates = scored.len(),
            "task selection complete"
        );
        Ok(scored)
    }

    /// The top candidate without claiming it.
    pub async fn select_next(
        &self,
        budget: i64,
        project: &str,
    ) -> Result<Option<ScoredTask>, StoreError> {
        Ok(self.select_top_n(budget, project, 1).await?.into_iter().next())
    }

    /// Select the top candidate and immediately claim it. Between this
    /// returning and the matching [`Selector::clear_assigned`], no other
    /// caller can receive the same (type, project).
    pub async fn select_and_assign(
        &self,
        budget: i64,
        project: &str,
    ) -> Result<Option<ScoredTask>, StoreError> {
        let candidates = self.select_top_n(budget, project, usize::MAX).await?;
        for task in candidates {
            let key = task_key(&task.definition.task_type, project);
            if self
                .store
                .mark_assigned(&key, project, task.definition.task_type.as_str())
                .await?
            {
                return Ok(Some(task));
            }
            // Lost the claim race; fall through to the next candidate.
        }
        Ok(None)
    }

    /// Release a claim taken by [`Selector::select_and_assign`].
    pub async fn clear_assigned(
        &self,
        task_type: &TaskType,
        project: &str,
    ) -> Result<(), StoreError> {
        self.store
            .clear_assigned(&task_key(task_type, project))
            .await
    }
}

/// Assignment key for a (task-type, project) pair.
pub fn task_key(task_type: &TaskType, project: &str) -> String {
    format!("{}:{}", task_type, canonical_project_path(project))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_shape() {
        assert_eq!(
            task_key(&TaskType::from("lint-fix"), "/test/project/"),
            "lint-fix:/test/project"
        );
    }
}
