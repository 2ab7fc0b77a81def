//! Built-in task definitions and the types that describe them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Kebab-case identifier of a task, globally unique across built-in and
/// custom definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Pr,
    Analysis,
    Options,
    Safe,
    Map,
    Emergency,
}

impl TaskCategory {
    /// Parse a config string, defaulting to `Analysis` when unrecognized.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pr" => TaskCategory::Pr,
            "options" => TaskCategory::Options,
            "safe" => TaskCategory::Safe,
            "map" => TaskCategory::Map,
            "emergency" => TaskCategory::Emergency,
            _ => TaskCategory::Analysis,
        }
    }

    /// Default cooldown for tasks in this category.
    pub fn default_cooldown(&self) -> Duration {
        const HOUR: u64 = 3600;
        match self {
            TaskCategory::Pr => Duration::from_secs(24 * HOUR),
            TaskCategory::Analysis => Duration::from_secs(48 * HOUR),
            TaskCategory::Options => Duration::from_secs(7 * 24 * HOUR),
            TaskCategory::Safe => Duration::from_secs(24 * HOUR),
            TaskCategory::Map => Duration::from_secs(7 * 24 * HOUR),
            TaskCategory::Emergency => Duration::from_secs(6 * HOUR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CostTier {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl CostTier {
    /// Parse a config string, defaulting to `Medium` when unrecognized.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => CostTier::Low,
            "high" => CostTier::High,
            "very-high" => CostTier::VeryHigh,
            _ => CostTier::Medium,
        }
    }

    /// Lower bound of the tier in tokens; the selector treats these as
    /// coarse budget gates.
    pub fn min_tokens(&self) -> i64 {
        match self {
            CostTier::Low => 10_000,
            CostTier::Medium => 50_000,
            CostTier::High => 150_000,
            CostTier::VeryHigh => 500_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Parse a config string, defaulting to `Low` when unrecognized.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            _ => RiskLevel::Low,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A registered unit of work. The description doubles as the agent prompt.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    pub category: TaskCategory,
    pub cost_tier: CostTier,
    pub risk_level: RiskLevel,
    pub default_cooldown: Duration,
    /// Skipped unless explicitly listed in `tasks.enabled`.
    pub disabled_by_default: bool,
    pub custom: bool,
}

impl TaskDefinition {
    fn builtin(
        task_type: &str,
        name: &str,
        description: &str,
        category: TaskCategory,
        cost_tier: CostTier,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            task_type: TaskType::from(task_type),
            name: name.to_string(),
            description: description.to_string(),
            category,
            cost_tier,
            risk_level,
            default_cooldown: category.default_cooldown(),
            disabled_by_default: false,
            custom: false,
        }
    }

    fn disabled_by_default(mut self) -> Self {
        self.disabled_by_default = true;
        self
    }

    fn cooldown(mut self, cooldown: Duration) -> Self {
        self.default_cooldown = cooldown;
        self
    }
}

/// The process-constant built-in catalog.
pub fn builtin_definitions() -> Vec<TaskDefinition> {
    const DAY: u64 = 24 * 3600;
    vec![
        TaskDefinition::builtin(
            "lint-fix",
            "Lint fixes",
            "Run the project's linters and formatters, fix every violation that \
             can be fixed mechanically, and open a pull request with the changes. \
             Do not change behavior.",
            TaskCategory::Pr,
            CostTier::Low,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "docs-backfill",
            "Documentation backfill",
            "Find public functions, modules, and configuration options that lack \
             documentation and write accurate doc comments for them, matching the \
             project's existing style. Open a pull request.",
            TaskCategory::Pr,
            CostTier::Medium,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "dead-code",
            "Dead code removal",
            "Locate unused functions, unreachable branches, and unreferenced \
             files. Remove them and open a pull request, keeping each removal \
             independently revertable.",
            TaskCategory::Pr,
            CostTier::Medium,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "test-coverage",
            "Test coverage",
            "Identify the least-tested modules with meaningful logic and add \
             focused tests for their observable behavior. Open a pull request.",
            TaskCategory::Pr,
            CostTier::High,
            RiskLevel::Medium,
        ),
        TaskDefinition::builtin(
            "dependency-bump",
            "Dependency updates",
            "Update outdated dependencies that have compatible releases, run the \
             test suite, and open a pull request listing each bump and its \
             changelog highlights.",
            TaskCategory::Pr,
            CostTier::Medium,
            RiskLevel::Medium,
        )
        .cooldown(Duration::from_secs(7 * DAY)),
        TaskDefinition::builtin(
            "bug-finder",
            "Bug hunt",
            "Read the most recently changed code paths and hunt for real bugs: \
             race conditions, error-handling gaps, off-by-one errors. Write a \
             report with file and line references; do not change code.",
            TaskCategory::Analysis,
            CostTier::High,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "security-audit",
            "Security audit",
            "Audit the codebase for injection risks, unsafe deserialization, \
             secrets in source, and permission problems. Write a prioritized \
             findings report; do not change code.",
            TaskCategory::Analysis,
            CostTier::High,
            RiskLevel::Low,
        )
        .cooldown(Duration::from_secs(7 * DAY)),
        TaskDefinition::builtin(
            "refactor-options",
            "Refactoring options",
            "Pick the most tangled module and sketch two or three refactoring \
             options with trade-offs. Write the proposal to a report; do not \
             change code.",
            TaskCategory::Options,
            CostTier::High,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "repo-map",
            "Repository map",
            "Produce a map of the repository: entry points, major modules, data \
             flow between them, and where configuration and persistence live. \
             Write it to a report file.",
            TaskCategory::Map,
            CostTier::Medium,
            RiskLevel::Low,
        ),
        TaskDefinition::builtin(
            "idea-generator",
            "Feature ideas",
            "Study the project's purpose and suggest a handful of small, \
             concrete improvements a maintainer could ship in a weekend. Write \
             them to a report.",
            TaskCategory::Options,
            CostTier::Medium,
            RiskLevel::Low,
        )
        .disabled_by_default(),
        TaskDefinition::builtin(
            "migration-rehearsal",
            "Migration rehearsal",
            "Identify the largest pending framework or language-version \
             migration, attempt it on a branch, and report exactly where it \
             breaks and how much work remains. Do not merge anything.",
            TaskCategory::Analysis,
            CostTier::VeryHigh,
            RiskLevel::High,
        )
        .disabled_by_default()
        .cooldown(Duration::from_secs(30 * DAY)),
        TaskDefinition::builtin(
            "emergency-fix",
            "Emergency fix",
            "Check for failing builds or red test suites on the default branch \
             and fix the most urgent breakage. Open a pull request immediately.",
            TaskCategory::Emergency,
            CostTier::High,
            RiskLevel::High,
        )
        .disabled_by_default(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_are_unique_and_kebab_case() {
        let defs = builtin_definitions();
        let mut seen = std::collections::HashSet::new();
        for def in &defs {
            assert!(seen.insert(def.task_type.clone()), "duplicate {}", def.task_type);
            assert!(
                ns_core::config::is_kebab_case(def.task_type.as_str()),
                "{} is not kebab-case",
                def.task_type
            );
            assert!(!def.name.is_empty());
            assert!(!def.description.is_empty());
            assert!(!def.custom);
        }
    }

    #[test]
    fn cost_tier_gates() {
        assert_eq!(CostTier::Low.min_tokens(), 10_000);
        assert_eq!(CostTier::Medium.min_tokens(), 50_000);
        assert_eq!(CostTier::High.min_tokens(), 150_000);
        assert_eq!(CostTier::VeryHigh.min_tokens(), 500_000);
    }

    #[test]
    fn lint_fix_cools_down_daily() {
        let defs = builtin_definitions();
        let lint = defs
            .iter()
            .find(|d| d.task_type.as_str() == "lint-fix")
            .unwrap();
        assert_eq!(lint.default_cooldown, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn parse_defaults_are_forgiving() {
        assert_eq!(TaskCategory::parse_or_default("PR"), TaskCategory::Pr);
        assert_eq!(TaskCategory::parse_or_default("bogus"), TaskCategory::Analysis);
        assert_eq!(CostTier::parse_or_default("very-high"), CostTier::VeryHigh);
        assert_eq!(CostTier::parse_or_default(""), CostTier::Medium);
        assert_eq!(RiskLevel::parse_or_default("HIGH"), RiskLevel::High);
        assert_eq!(RiskLevel::parse_or_default("?"), RiskLevel::Low);
    }
}
