use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;
use tracing::{info, warn};

use crate::legacy::LegacyState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("legacy import: {0}")]
    LegacyImport(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// A single forward-only schema migration. The list below is append-only.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema",
    sql: "
        CREATE TABLE IF NOT EXISTS projects (
            path       TEXT PRIMARY KEY,
            priority   INTEGER NOT NULL DEFAULT 0,
            last_run   TEXT,
            run_count  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS task_history (
            project    TEXT NOT NULL,
            task_type  TEXT NOT NULL,
            last_run   TEXT NOT NULL,
            PRIMARY KEY (project, task_type)
        );

        CREATE TABLE IF NOT EXISTS assigned_tasks (
            key         TEXT PRIMARY KEY,
            project     TEXT NOT NULL,
            task_type   TEXT NOT NULL,
            assigned_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            start_time  TEXT NOT NULL,
            end_time    TEXT,
            project     TEXT NOT NULL,
            tasks       TEXT,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            status      TEXT NOT NULL,
            error       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_run_history_start
            ON run_history(start_time DESC);

        CREATE TABLE IF NOT EXISTS snapshots (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            provider        TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            week_start      TEXT NOT NULL,
            local_tokens    INTEGER NOT NULL DEFAULT 0,
            local_daily     INTEGER NOT NULL DEFAULT 0,
            scraped_pct     REAL,
            inferred_budget INTEGER,
            day_of_week     INTEGER NOT NULL,
            hour_of_day     INTEGER NOT NULL,
            week_number     INTEGER NOT NULL,
            year            INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_provider_ts
            ON snapshots(provider, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_snapshots_provider_week
            ON snapshots(provider, year, week_number);
    ",
}];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub path: String,
    pub priority: i64,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: i64,
}

#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub key: String,
    pub project: String,
    pub task_type: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    fn from_sql(raw: &str) -> Self {
        match raw {
            "success" => RunStatus::Success,
            "partial" => RunStatus::Partial,
            _ => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub project: String,
    /// Opaque blob describing the tasks in this run (JSON).
    pub tasks: Option<String>,
    pub tokens_used: i64,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: i64,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub week_start: DateTime<Utc>,
    pub local_tokens: i64,
    pub local_daily: i64,
    pub scraped_pct: Option<f64>,
    pub inferred_budget: Option<i64>,
    pub day_of_week: i64,
    pub hour_of_day: i64,
    pub week_number: i64,
    pub year: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct HourlyAverage {
    pub hour: i64,
    pub avg_daily_tokens: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub count: i64,
    pub first_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub total_tokens: i64,
}

// ---------------------------------------------------------------------------
// Path canonicalization
// ---------------------------------------------------------------------------

/// Canonical form used as the projects primary key: absolute, no trailing
/// separators.
pub fn canonical_project_path(path: &str) -> String {
    let p = Path::new(path);
    let abs: PathBuf = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|d| d.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };
    let s = abs.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed store owning all mutable nightshift state. Single writer;
/// one connection shared by the daemon and the CLI commands.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path, applying pending
    /// migrations and importing the legacy state file if one exists next to
    /// the database under `state/state.json`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)?;
        }

        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init().await?;

        if let Some(parent) = path.parent() {
            let legacy_path = parent.join("state").join("state.json");
            if legacy_path.exists() {
                match store.import_legacy(&legacy_path).await {
                    Ok(counts) => info!(
                        projects = counts.projects,
                        task_runs = counts.task_runs,
                        assignments = counts.assignments,
                        runs = counts.runs,
                        "legacy state imported"
                    ),
                    Err(e) => warn!(error = %e, "legacy state import failed, file left in place"),
                }
            }
        }

        Ok(store)
    }

    /// Create a purely in-memory store (tests).
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS schema_version (
                        version    INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    );
                    ",
                )?;

                let current: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                    [],
                    |r| r.get(0),
                )?;

                for m in MIGRATIONS.iter().filter(|m| m.version > current) {
                    let tx = conn.transaction()?;
                    tx.execute_batch(m.sql)?;
                    tx.execute(
                        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                        params![m.version, Utc::now().to_rfc3339()],
                    )?;
                    tx.commit()?;
                }
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Highest applied migration version (0 on a schema-only database).
    pub async fn current_version(&self) -> Result<i64> {
        self.conn
            .call(|conn| {
                let v = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                    [],
                    |r| r.get(0),
                )?;
                Ok(v)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Record a completed run for a project: bumps `run_count` and sets
    /// `last_run`, creating the row on first observation.
    pub async fn record_project_run(&self, path: &str) -> Result<()> {
        self.record_project_run_at(path, Utc::now()).await
    }

    pub async fn record_project_run_at(&self, path: &str, at: DateTime<Utc>) -> Result<()> {
        let path = canonical_project_path(path);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (path, last_run, run_count) VALUES (?1, ?2, 1)
                     ON CONFLICT(path) DO UPDATE SET
                        last_run = excluded.last_run,
                        run_count = run_count + 1",
                    params![path, at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn set_project_priority(&self, path: &str, priority: i64) -> Result<()> {
        let path = canonical_project_path(path);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (path, priority) VALUES (?1, ?2)
                     ON CONFLICT(path) DO UPDATE SET priority = excluded.priority",
                    params![path, priority],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_project(&self, path: &str) -> Result<Option<ProjectRecord>> {
        let path = canonical_project_path(path);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, priority, last_run, run_count FROM projects WHERE path = ?1",
                )?;
                let mut rows = stmt.query(params![path])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// All known projects, ordered by path for stable presentation.
    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, priority, last_run, run_count FROM projects ORDER BY path ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Task history
    // -----------------------------------------------------------------------

    /// Record that a task completed on a project (any outcome). Drives
    /// cooldown and staleness.
    pub async fn record_task_run(&self, project: &str, task_type: &str) -> Result<()> {
        self.record_task_run_at(project, task_type, Utc::now()).await
    }

    pub async fn record_task_run_at(
        &self,
        project: &str,
        task_type: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let project = canonical_project_path(project);
        let task_type = task_type.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_history (project, task_type, last_run) VALUES (?1, ?2, ?3)
                     ON CONFLICT(project, task_type) DO UPDATE SET last_run = excluded.last_run",
                    params![project, task_type, at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn last_task_run(
        &self,
        project: &str,
        task_type: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let project = canonical_project_path(project);
        let task_type = task_type.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT last_run FROM task_history WHERE project = ?1 AND task_type = ?2",
                )?;
                let mut rows = stmt.query(params![project, task_type])?;
                match rows.next()? {
                    Some(row) => {
                        let raw: String = row.get(0)?;
                        Ok(Some(parse_ts(&raw)?))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Assignments
    // -----------------------------------------------------------------------

    /// Claim a (task-type, project) pair. Returns false when the key is
    /// already claimed; at most one claim per key can exist.
    pub async fn mark_assigned(&self, key: &str, project: &str, task_type: &str) -> Result<bool> {
        let key = key.to_string();
        let project = canonical_project_path(project);
        let task_type = task_type.to_string();
        self.conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO assigned_tasks (key, project, task_type, assigned_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO NOTHING",
                    params![key, project, task_type, Utc::now().to_rfc3339()],
                )?;
                Ok(inserted > 0)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn is_assigned(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM assigned_tasks WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn clear_assigned(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM assigned_tasks WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_assigned(&self) -> Result<Vec<AssignmentRecord>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, project, task_type, assigned_at
                     FROM assigned_tasks ORDER BY key ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let assigned_raw: String = row.get(3)?;
                    out.push(AssignmentRecord {
                        key: row.get(0)?,
                        project: row.get(1)?,
                        task_type: row.get(2)?,
                        assigned_at: parse_ts(&assigned_raw)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Delete claims older than `max_age`. A zero age clears everything;
    /// used by the daemon's startup sweep.
    pub async fn clear_stale_assignments(&self, max_age: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        self.conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM assigned_tasks WHERE assigned_at <= ?1",
                    params![cutoff.to_rfc3339()],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    pub async fn append_run(&self, run: &RunRecord) -> Result<i64> {
        let start = run.start_time.to_rfc3339();
        let end = run.end_time.map(|t| t.to_rfc3339());
        let project = run.project.clone();
        let tasks = run.tasks.clone();
        let tokens = run.tokens_used;
        let status = run.status.as_str();
        let error = run.error.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO run_history
                        (start_time, end_time, project, tasks, tokens_used, status, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![start, end, project, tasks, tokens, status, error],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, start_time, end_time, project, tasks, tokens_used, status, error
                     FROM run_history ORDER BY start_time DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn run_totals(&self) -> Result<RunTotals> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM run_history", [], |r| r.get(0))?;
                if count == 0 {
                    return Ok(RunTotals::default());
                }
                let (first, last): (Option<String>, Option<String>) = conn.query_row(
                    "SELECT MIN(start_time), MAX(start_time) FROM run_history",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                let total_tokens: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(tokens_used), 0) FROM run_history",
                    [],
                    |r| r.get(0),
                )?;
                Ok(RunTotals {
                    count,
                    first_run: first.as_deref().map(parse_ts).transpose()?,
                    last_run: last.as_deref().map(parse_ts).transpose()?,
                    total_tokens,
                })
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub async fn insert_snapshot(&self, row: &SnapshotRow) -> Result<i64> {
        let row = row.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO snapshots
                        (provider, timestamp, week_start, local_tokens, local_daily,
                         scraped_pct, inferred_budget, day_of_week, hour_of_day,
                         week_number, year)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        row.provider,
                        row.timestamp.to_rfc3339(),
                        row.week_start.to_rfc3339(),
                        row.local_tokens,
                        row.local_daily,
                        row.scraped_pct,
                        row.inferred_budget,
                        row.day_of_week,
                        row.hour_of_day,
                        row.week_number,
                        row.year,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn latest_snapshots(&self, provider: &str, n: i64) -> Result<Vec<SnapshotRow>> {
        let provider = provider.to_lowercase();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider, timestamp, week_start, local_tokens, local_daily,
                            scraped_pct, inferred_budget, day_of_week, hour_of_day,
                            week_number, year
                     FROM snapshots WHERE provider = ?1
                     ORDER BY timestamp DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![provider, n])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_snapshot(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Snapshots for the week beginning at `week_start`, oldest first.
    pub async fn snapshots_for_week(
        &self,
        provider: &str,
        week_start: DateTime<Utc>,
    ) -> Result<Vec<SnapshotRow>> {
        let provider = provider.to_lowercase();
        let week_start = week_start.to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider, timestamp, week_start, local_tokens, local_daily,
                            scraped_pct, inferred_budget, day_of_week, hour_of_day,
                            week_number, year
                     FROM snapshots WHERE provider = ?1 AND week_start = ?2
                     ORDER BY timestamp ASC",
                )?;
                let mut rows = stmt.query(params![provider, week_start])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_snapshot(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Average same-day tokens grouped by hour over a lookback window.
    pub async fn hourly_averages(
        &self,
        provider: &str,
        lookback_days: i64,
    ) -> Result<Vec<HourlyAverage>> {
        if lookback_days <= 0 {
            return Ok(Vec::new());
        }
        let provider = provider.to_lowercase();
        let cutoff = (Utc::now() - chrono::Duration::days(lookback_days)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT hour_of_day, AVG(local_daily)
                     FROM snapshots WHERE provider = ?1 AND timestamp >= ?2
                     GROUP BY hour_of_day ORDER BY hour_of_day ASC",
                )?;
                let mut rows = stmt.query(params![provider, cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(HourlyAverage {
                        hour: row.get(0)?,
                        avg_daily_tokens: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Delete snapshots older than the retention window. `<= 0` disables.
    pub async fn prune_snapshots(&self, retention_days: i64) -> Result<u64> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM snapshots WHERE timestamp < ?1",
                    params![cutoff],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Into::into)
    }

    /// Most recent snapshot carrying an inferred budget, if any.
    pub async fn latest_inferred_snapshot(&self) -> Result<Option<SnapshotRow>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider, timestamp, week_start, local_tokens, local_daily,
                            scraped_pct, inferred_budget, day_of_week, hour_of_day,
                            week_number, year
                     FROM snapshots WHERE inferred_budget IS NOT NULL
                     ORDER BY timestamp DESC LIMIT 1",
                )?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_snapshot(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Average of non-zero same-day token counts over the trailing window.
    pub async fn avg_daily_usage(&self, provider: &str, days: i64) -> Result<Option<f64>> {
        let provider = provider.to_lowercase();
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let avg: Option<f64> = conn.query_row(
                    "SELECT AVG(local_daily) FROM snapshots
                     WHERE provider = ?1 AND timestamp >= ?2 AND local_daily > 0",
                    params![provider, cutoff],
                    |r| r.get(0),
                )?;
                Ok(avg)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Legacy import
    // -----------------------------------------------------------------------

    /// Import the legacy key-value state file inside one transaction, then
    /// rename it with a `.migrated` suffix. Any failure leaves the file
    /// untouched.
    pub async fn import_legacy(&self, state_path: &Path) -> Result<LegacyImportCounts> {
        let text = std::fs::read_to_string(state_path)?;
        let state: LegacyState =
            serde_json::from_str(&text).map_err(|e| StoreError::LegacyImport(e.to_string()))?;

        let counts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut counts = LegacyImportCounts::default();

                for (path, p) in &state.projects {
                    tx.execute(
                        "INSERT INTO projects (path, last_run, run_count) VALUES (?1, ?2, ?3)
                         ON CONFLICT(path) DO NOTHING",
                        params![
                            canonical_project_path(path),
                            p.last_run.map(|t| t.to_rfc3339()),
                            p.run_count,
                        ],
                    )?;
                    counts.projects += 1;
                }

                for (project, runs) in &state.task_runs {
                    for (task_type, at) in runs {
                        tx.execute(
                            "INSERT INTO task_history (project, task_type, last_run)
                             VALUES (?1, ?2, ?3)
                             ON CONFLICT(project, task_type) DO NOTHING",
                            params![
                                canonical_project_path(project),
                                task_type,
                                at.to_rfc3339(),
                            ],
                        )?;
                        counts.task_runs += 1;
                    }
                }

                for (key, a) in &state.assigned_tasks {
                    tx.execute(
                        "INSERT INTO assigned_tasks (key, project, task_type, assigned_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(key) DO NOTHING",
                        params![
                            key,
                            canonical_project_path(&a.project),
                            a.task_type,
                            a.assigned_at.unwrap_or_else(Utc::now).to_rfc3339(),
                        ],
                    )?;
                    counts.assignments += 1;
                }

                for r in &state.run_history {
                    tx.execute(
                        "INSERT INTO run_history
                            (start_time, end_time, project, tasks, tokens_used, status, error)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            r.start_time.to_rfc3339(),
                            r.end_time.map(|t| t.to_rfc3339()),
                            canonical_project_path(&r.project),
                            r.tasks.as_ref().map(|v| v.to_string()),
                            r.tokens_used,
                            if r.status.is_empty() { "failed" } else { r.status.as_str() },
                            r.error,
                        ],
                    )?;
                    counts.runs += 1;
                }

                tx.commit()?;
                Ok(counts)
            })
            .await?;

        let migrated = state_path.with_extension("json.migrated");
        std::fs::rename(state_path, migrated)?;
        Ok(counts)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyImportCounts {
    pub projects: u64,
    pub task_runs: u64,
    pub assignments: u64,
    pub runs: u64,
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRecord> {
    let last_run_raw: Option<String> = row.get(2)?;
    Ok(ProjectRecord {
        path: row.get(0)?,
        priority: row.get(1)?,
        last_run: last_run_raw.as_deref().map(parse_ts).transpose()?,
        run_count: row.get(3)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let start_raw: String = row.get(1)?;
    let end_raw: Option<String> = row.get(2)?;
    let status_raw: String = row.get(6)?;
    Ok(RunRecord {
        id: row.get(0)?,
        start_time: parse_ts(&start_raw)?,
        end_time: end_raw.as_deref().map(parse_ts).transpose()?,
        project: row.get(3)?,
        tasks: row.get(4)?,
        tokens_used: row.get(5)?,
        status: RunStatus::from_sql(&status_raw),
        error: row.get(7)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    let ts_raw: String = row.get(2)?;
    let week_raw: String = row.get(3)?;
    Ok(SnapshotRow {
        id: row.get(0)?,
        provider: row.get(1)?,
        timestamp: parse_ts(&ts_raw)?,
        week_start: parse_ts(&week_raw)?,
        local_tokens: row.get(4)?,
        local_daily: row.get(5)?,
        scraped_pct: row.get(6)?,
        inferred_budget: row.get(7)?,
        day_of_week: row.get(8)?,
        hour_of_day: row.get(9)?,
        week_number: row.get(10)?,
        year: row.get(11)?,
    })
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
