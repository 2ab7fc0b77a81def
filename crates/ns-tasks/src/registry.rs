//! Process-wide task registry.
//!
//! Built-ins are loaded once; custom definitions from configuration are
//! registered at startup as a group with rollback on any failure, so every
//! selector sees the same catalog.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use ns_core::config::{is_kebab_case, parse_duration, CustomTaskConfig};
use tracing::info;

use crate::definitions::{
    builtin_definitions, CostTier, RiskLevel, TaskCategory, TaskDefinition, TaskType,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task type {0:?} is already registered")]
    Collision(String),
    #[error("task type {0:?} is not kebab-case")]
    InvalidType(String),
    #[error("custom task {task:?}: invalid interval {interval:?}")]
    InvalidInterval { task: String, interval: String },
    #[error("custom task {0:?}: empty name or description")]
    IncompleteDefinition(String),
}

static REGISTRY: OnceLock<RwLock<HashMap<TaskType, TaskDefinition>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<TaskType, TaskDefinition>> {
    REGISTRY.get_or_init(|| {
        let map = builtin_definitions()
            .into_iter()
            .map(|def| (def.task_type.clone(), def))
            .collect();
        RwLock::new(map)
    })
}

pub fn get_definition(task_type: &TaskType) -> Option<TaskDefinition> {
    registry()
        .read()
        .ok()
        .and_then(|map| map.get(task_type).cloned())
}

pub fn is_custom(task_type: &TaskType) -> bool {
    get_definition(task_type).is_some_and(|def| def.custom)
}

/// Every registered definition in a deterministic order (by type). Used
/// wherever stable presentation matters.
pub fn all_definitions_sorted() -> Vec<TaskDefinition> {
    let mut defs: Vec<TaskDefinition> = registry()
        .read()
        .map(|map| map.values().cloned().collect())
        .unwrap_or_default();
    defs.sort_by(|a, b| a.task_type.cmp(&b.task_type));
    defs
}

/// Register one custom definition; rejects collisions with anything already
/// registered, built-ins included.
pub fn register_custom(def: TaskDefinition) -> Result<(), RegistryError> {
    if !is_kebab_case(def.task_type.as_str()) {
        return Err(RegistryError::InvalidType(def.task_type.to_string()));
    }
    let Ok(mut map) = registry().write() else {
        return Err(RegistryError::Collision(def.task_type.to_string()));
    };
    if map.contains_key(&def.task_type) {
        return Err(RegistryError::Collision(def.task_type.to_string()));
    }
    map.insert(def.task_type.clone(), def);
    Ok(())
}

/// Remove a custom definition. Built-ins are never removed.
pub fn unregister_custom(task_type: &TaskType) {
    if let Ok(mut map) = registry().write() {
        if map.get(task_type).is_some_and(|def| def.custom) {
            map.remove(task_type);
        }
    }
}

/// Register custom tasks from configuration as a group. On any failure the
/// definitions registered by this call are rolled back.
pub fn register_custom_tasks(customs: &[CustomTaskConfig]) -> Result<(), RegistryError> {
    let mut registered: Vec<TaskType> = Vec::new();

    let rollback = |registered: &[TaskType]| {
        for t in registered {
            unregister_custom(t);
        }
    };

    for c in customs {
        if c.name.trim().is_empty() || c.description.trim().is_empty() {
            rollback(&registered);
            return Err(RegistryError::IncompleteDefinition(c.task_type.clone()));
        }

        let category = TaskCategory::parse_or_default(c.category.as_deref().unwrap_or(""));
        let mut cooldown = category.default_cooldown();
        if let Some(interval) = c.interval.as_deref().filter(|i| !i.is_empty()) {
            match parse_duration(interval) {
                Ok(d) => cooldown = d,
                Err(_) => {
                    rollback(&registered);
                    return Err(RegistryError::InvalidInterval {
                        task: c.task_type.clone(),
                        interval: interval.to_string(),
                    });
                }
            }
        }

        let def = TaskDefinition {
            task_type: TaskType::new(&c.task_type),
            name: c.name.clone(),
            description: c.description.clone(),
            category,
            cost_tier: CostTier::parse_or_default(c.cost_tier.as_deref().unwrap_or("")),
            risk_level: RiskLevel::parse_or_default(c.risk_level.as_deref().unwrap_or("")),
            default_cooldown: cooldown,
            disabled_by_default: false,
            custom: true,
        };

        let task_type = def.task_type.clone();
        if let Err(e) = register_custom(def) {
            rollback(&registered);
            return Err(e);
        }
        registered.push(task_type);
    }

    if !registered.is_empty() {
        info!(count = registered.len(), "custom tasks registered");
    }
    Ok(())
}
