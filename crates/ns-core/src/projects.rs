//! Project discovery: explicit paths and glob patterns with excludes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{expand_path, Config};
use crate::store::canonical_project_path;

/// A project resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProject {
    pub path: String,
    pub priority: i64,
}

/// Resolve all projects from configuration: expand glob patterns, apply
/// excludes, verify directories, and dedupe (one project per path).
pub fn discover(config: &Config) -> Vec<ResolvedProject> {
    let mut seen = HashSet::new();
    let mut projects = Vec::new();

    for pc in &config.projects {
        if let Some(pattern) = pc.pattern.as_deref().filter(|p| !p.is_empty()) {
            for path in expand_glob_patterns(&[pattern.to_string()], &pc.exclude) {
                push_project(&mut projects, &mut seen, &path, pc.priority);
            }
        } else if let Some(path) = pc.path.as_deref().filter(|p| !p.is_empty()) {
            let expanded = expand_path(path);
            if expanded.is_dir() {
                push_project(&mut projects, &mut seen, &expanded, pc.priority);
            } else {
                debug!(path = %expanded.display(), "skipping non-directory project");
            }
        }
    }

    projects
}

fn push_project(
    projects: &mut Vec<ResolvedProject>,
    seen: &mut HashSet<String>,
    path: &Path,
    priority: i64,
) {
    let canonical = canonical_project_path(&path.to_string_lossy());
    if seen.insert(canonical.clone()) {
        projects.push(ResolvedProject {
            path: canonical,
            priority,
        });
    }
}

/// Expand glob patterns into directories, filtering out excluded paths.
/// A path is excluded when it matches an exclude exactly or sits beneath one.
pub fn expand_glob_patterns(patterns: &[String], excludes: &[String]) -> Vec<PathBuf> {
    let exclude_set: HashSet<PathBuf> = excludes
        .iter()
        .map(|e| expand_path(e))
        .map(|p| PathBuf::from(canonical_project_path(&p.to_string_lossy())))
        .collect();

    let mut results = Vec::new();
    for pattern in patterns {
        let pattern = expand_path(pattern);
        let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
            continue;
        };
        for entry in paths.flatten() {
            let abs = PathBuf::from(canonical_project_path(&entry.to_string_lossy()));
            if exclude_set.contains(&abs) {
                continue;
            }
            if exclude_set.iter().any(|exc| abs.starts_with(exc)) {
                continue;
            }
            if abs.is_dir() {
                results.push(abs);
            }
        }
    }
    results.sort();
    results
}

/// Order projects for a run: priority descending, then least recently run
/// first (a missing last-run counts as most stale), then path.
pub fn sort_for_run(
    projects: &mut [ResolvedProject],
    last_runs: &HashMap<String, DateTime<Utc>>,
) {
    projects.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| {
                let a_last = last_runs.get(&a.path);
                let b_last = last_runs.get(&b.path);
                match (a_last, b_last) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(y),
                }
            })
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// Whether a directory looks like a project root.
pub fn is_project_path(path: &Path) -> bool {
    const INDICATORS: &[&str] = &[
        ".git",
        "Cargo.toml",
        "go.mod",
        "package.json",
        "pyproject.toml",
        "requirements.txt",
        "Makefile",
        ".nightshift.toml",
    ];
    INDICATORS.iter().any(|ind| path.join(ind).exists())
}

/// Find project directories directly under `dir` (non-recursive).
pub fn discover_in_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut projects = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && is_project_path(&path) {
            projects.push(path);
        }
    }
    projects.sort();
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use chrono::TimeZone;

    fn make_dir(root: &Path, name: &str, with_git: bool) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        if with_git {
            std::fs::create_dir_all(dir.join(".git")).unwrap();
        }
        dir
    }

    #[test]
    fn discovers_explicit_paths_and_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = make_dir(tmp.path(), "proj", true);

        let mut cfg = Config::default();
        cfg.projects = vec![
            ProjectConfig {
                path: Some(proj.to_string_lossy().into_owned()),
                pattern: None,
                exclude: vec![],
                priority: 5,
            },
            ProjectConfig {
                // trailing slash resolves to the same project
                path: Some(format!("{}/", proj.to_string_lossy())),
                pattern: None,
                exclude: vec![],
                priority: 1,
            },
        ];

        let projects = discover(&cfg);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].priority, 5);
    }

    #[test]
    fn glob_expansion_honors_excludes() {
        let tmp = tempfile::tempdir().unwrap();
        make_dir(tmp.path(), "a", true);
        make_dir(tmp.path(), "b", true);
        let excluded = make_dir(tmp.path(), "vendor", true);
        make_dir(&excluded, "nested", true);

        let pattern = format!("{}/*", tmp.path().to_string_lossy());
        let results = expand_glob_patterns(
            &[pattern],
            &[excluded.to_string_lossy().into_owned()],
        );

        let names: Vec<String> = results
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(!names.contains(&"vendor".to_string()));
    }

    #[test]
    fn sort_prefers_priority_then_staleness() {
        let mut projects = vec![
            ResolvedProject { path: "/p1".into(), priority: 0 },
            ResolvedProject { path: "/p2".into(), priority: 0 },
            ResolvedProject { path: "/p3".into(), priority: 9 },
        ];
        let mut last_runs = HashMap::new();
        last_runs.insert(
            "/p1".to_string(),
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
        );
        // /p2 never ran -> more stale than /p1.

        sort_for_run(&mut projects, &last_runs);
        assert_eq!(projects[0].path, "/p3");
        assert_eq!(projects[1].path, "/p2");
        assert_eq!(projects[2].path, "/p1");
    }

    #[test]
    fn project_indicators() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = make_dir(tmp.path(), "plain", false);
        let repo = make_dir(tmp.path(), "repo", true);

        assert!(!is_project_path(&plain));
        assert!(is_project_path(&repo));

        let found = discover_in_dir(tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("repo"));
    }
}
