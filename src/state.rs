//! State Management - SQLite-based persistence for release observations
//!
//! This module provides durable storage for:
//! - Per-repository release state (last seen tag, check timestamps, failures)
//! - Service metadata (daily report markers and similar one-off facts)
//!
//! The database is stored in XDG_DATA_HOME/relwatch/state.db. A row for a
//! repository is written only once a check has fully resolved, so restarts
//! never resurrect half-finished observations.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::repo::RepoId;

/// Recorded release state for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseState {
    pub repo: String,
    /// Exact tag string of the last release acted upon
    pub last_seen_tag: String,
    /// Publication timestamp of that release, when GitHub reported one
    pub last_seen_published_at: Option<DateTime<Utc>>,
    /// When this repository was last successfully checked
    pub last_checked_at: DateTime<Utc>,
    /// Consecutive transient check failures since the last success
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

/// State database manager
pub struct ReleaseStore {
    conn: Mutex<Connection>,
}

impl ReleaseStore {
    /// Open or create the state database at the default location
    pub fn open() -> Result<Self> {
        Self::open_at(default_db_path()?)
    }

    /// Open or create the state database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                -- Per-repository release state
                CREATE TABLE IF NOT EXISTS release_state (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo TEXT UNIQUE NOT NULL,
                    last_seen_tag TEXT NOT NULL,
                    last_seen_published_at TEXT,
                    last_checked_at TEXT NOT NULL,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                -- One-off service facts (daily report markers etc.)
                CREATE TABLE IF NOT EXISTS service_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_release_state_repo ON release_state(repo);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("State database lock poisoned"))
    }

    // =========================================================================
    // Release State Operations
    // =========================================================================

    /// Record a resolved observation: the given tag has been seen and acted
    /// upon. Resets the failure counter.
    pub fn commit_observation(
        &self,
        repo: &RepoId,
        tag: &str,
        published_at: Option<DateTime<Utc>>,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO release_state (repo, last_seen_tag, last_seen_published_at, last_checked_at, consecutive_failures, updated_at)
                VALUES (?1, ?2, ?3, ?4, 0, ?5)
                ON CONFLICT(repo) DO UPDATE SET
                    last_seen_tag = ?2,
                    last_seen_published_at = ?3,
                    last_checked_at = ?4,
                    consecutive_failures = 0,
                    updated_at = ?5
                "#,
                params![
                    repo.as_str(),
                    tag,
                    published_at.map(|dt| dt.to_rfc3339()),
                    checked_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to commit observation")?;

        debug!("Committed observation: {} -> {}", repo, tag);
        Ok(())
    }

    /// Record a successful check that found nothing new. No-op for
    /// repositories without recorded state.
    pub fn mark_checked(&self, repo: &RepoId, checked_at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                UPDATE release_state
                SET last_checked_at = ?2, consecutive_failures = 0, updated_at = ?2
                WHERE repo = ?1
                "#,
                params![repo.as_str(), checked_at.to_rfc3339()],
            )
            .context("Failed to mark repository checked")?;

        Ok(())
    }

    /// Bump the failure counter for a repository that already has recorded
    /// state. Returns false when no row exists; failures before the first
    /// successful observation are not persisted.
    pub fn record_failure(&self, repo: &RepoId, checked_at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                r#"
                UPDATE release_state
                SET consecutive_failures = consecutive_failures + 1, updated_at = ?2
                WHERE repo = ?1
                "#,
                params![repo.as_str(), checked_at.to_rfc3339()],
            )
            .context("Failed to record check failure")?;

        Ok(updated > 0)
    }

    /// Get the recorded state for one repository
    pub fn get(&self, repo: &RepoId) -> Result<Option<ReleaseState>> {
        let result = self
            .conn()?
            .query_row(
                r#"
                SELECT repo, last_seen_tag, last_seen_published_at, last_checked_at, consecutive_failures, updated_at
                FROM release_state
                WHERE repo = ?1
                "#,
                params![repo.as_str()],
                map_release_state,
            )
            .optional()
            .context("Failed to query release state")?;

        Ok(result)
    }

    /// All recorded repository states, ordered by repository name
    pub fn all(&self) -> Result<Vec<ReleaseState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT repo, last_seen_tag, last_seen_published_at, last_checked_at, consecutive_failures, updated_at
            FROM release_state
            ORDER BY repo
            "#,
        )?;

        let states = stmt
            .query_map([], map_release_state)
            .context("Failed to query release states")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect release states")?;

        Ok(states)
    }

    /// Forget everything recorded for a repository. Returns false when there
    /// was nothing to forget.
    pub fn reset(&self, repo: &RepoId) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM release_state WHERE repo = ?1",
                params![repo.as_str()],
            )
            .context("Failed to reset release state")?;

        if deleted > 0 {
            info!("Reset recorded state for {}", repo);
        }
        Ok(deleted > 0)
    }

    // =========================================================================
    // Service Metadata Operations
    // =========================================================================

    /// Read a service metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn()?
            .query_row(
                "SELECT value FROM service_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query service state")?;

        Ok(result)
    }

    /// Write a service metadata value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO service_state (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
                "#,
                params![key, value, Utc::now().to_rfc3339()],
            )
            .context("Failed to write service state")?;

        Ok(())
    }
}

/// Get the default database path
pub fn default_db_path() -> Result<PathBuf> {
    let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from("/tmp")
    };

    Ok(data_dir.join("relwatch").join("state.db"))
}

fn map_release_state(row: &Row<'_>) -> rusqlite::Result<ReleaseState> {
    Ok(ReleaseState {
        repo: row.get(0)?,
        last_seen_tag: row.get(1)?,
        last_seen_published_at: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        last_checked_at: row
            .get::<_, String>(3)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        consecutive_failures: row.get(4)?,
        updated_at: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    })
}
