//! Task catalog, process-wide registry, and the priority-scoring selector.

pub mod definitions;
pub mod registry;
pub mod selector;

pub use definitions::{CostTier, RiskLevel, TaskCategory, TaskDefinition, TaskType};
pub use selector::{ScoredTask, Selector};
