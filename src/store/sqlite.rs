//! SQLite-backed membership store.
//!
//! Each call opens its own connection and runs inside a `BEGIN IMMEDIATE`
//! transaction, which takes the write lock before the first read. That makes
//! the read-then-write compound operations linearizable. A transaction that
//! is not committed rolls back on drop, so a failed step leaves nothing
//! behind.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

use super::{FrontChange, Identity, LegacyStore, MembershipStore, UpsertOutcome, SUPPORT_KEY};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stack_members (
    channel TEXT NOT NULL,
    identity TEXT NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (channel, identity)
);
CREATE INDEX IF NOT EXISTS idx_stack_members_order ON stack_members(channel, score, identity);
CREATE TABLE IF NOT EXISTS legacy_stacks (
    channel TEXT NOT NULL,
    position INTEGER NOT NULL,
    entry TEXT NOT NULL,
    PRIMARY KEY (channel, position)
);
CREATE TABLE IF NOT EXISTS support_markers (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Durable store in a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { path, busy_timeout };
        let conn = store.connect()?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| Error::store("sqlite journal mode", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::store("sqlite init", e))?;

        tracing::debug!("Opened sqlite store {} (journal_mode={})", store.path.display(), mode);
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| Error::store("sqlite open", e))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| Error::store("sqlite busy timeout", e))?;
        Ok(conn)
    }

    /// Run `f` inside an immediate transaction and commit it.
    fn atomically<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::store(op, e))?;
        let out = f(&*tx)?;
        tx.commit().map_err(|e| Error::store(op, e))?;
        Ok(out)
    }
}

fn sweep_in(conn: &Connection, channel: &str, horizon: f64) -> Result<usize> {
    let removed = conn
        .execute(
            "DELETE FROM stack_members WHERE channel = ?1 AND score < ?2",
            params![channel, horizon],
        )
        .map_err(|e| Error::store("sqlite sweep", e))?;
    if removed > 0 {
        tracing::debug!("Swept {} expired member(s) from {}", removed, channel);
    }
    Ok(removed)
}

fn members_in(conn: &Connection, channel: &str) -> Result<Vec<Identity>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT identity FROM stack_members WHERE channel = ?1 ORDER BY score ASC, identity ASC",
        )
        .map_err(|e| Error::store("sqlite prepare members", e))?;
    let rows = stmt
        .query_map(params![channel], |row| row.get::<_, String>(0))
        .map_err(|e| Error::store("sqlite query members", e))?;

    let mut members = Vec::new();
    for row in rows {
        members.push(Identity::new(row.map_err(|e| Error::store("sqlite read member", e))?));
    }
    Ok(members)
}

fn front_in(conn: &Connection, channel: &str) -> Result<Option<Identity>> {
    conn.query_row(
        "SELECT identity FROM stack_members WHERE channel = ?1 ORDER BY score ASC, identity ASC LIMIT 1",
        params![channel],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|front| front.map(Identity::new))
    .map_err(|e| Error::store("sqlite query front", e))
}

fn upsert_in(conn: &Connection, channel: &str, identity: &Identity, score: f64) -> Result<UpsertOutcome> {
    let members = members_in(conn, channel)?;
    let replaced = members.contains(identity);
    let predecessors = members.into_iter().filter(|m| m != identity).collect();

    conn.execute(
        "INSERT INTO stack_members (channel, identity, score) VALUES (?1, ?2, ?3)
         ON CONFLICT(channel, identity) DO UPDATE SET score = excluded.score",
        params![channel, identity.as_str(), score],
    )
    .map_err(|e| Error::store("sqlite upsert", e))?;

    Ok(UpsertOutcome {
        predecessors,
        replaced,
    })
}

fn remove_in(conn: &Connection, channel: &str, identity: &Identity) -> Result<FrontChange> {
    let was_front = front_in(conn, channel)?.as_ref() == Some(identity);

    conn.execute(
        "DELETE FROM stack_members WHERE channel = ?1 AND identity = ?2",
        params![channel, identity.as_str()],
    )
    .map_err(|e| Error::store("sqlite remove", e))?;

    if !was_front {
        return Ok(FrontChange::Unchanged);
    }
    Ok(match front_in(conn, channel)? {
        Some(next) => FrontChange::Succeeded(next),
        None => FrontChange::Emptied,
    })
}

impl MembershipStore for SqliteStore {
    fn sweep(&self, channel: &str, horizon: f64) -> Result<usize> {
        self.atomically("sqlite sweep", |conn| sweep_in(conn, channel, horizon))
    }

    fn snapshot(&self, channel: &str, horizon: f64) -> Result<Vec<Identity>> {
        self.atomically("sqlite snapshot", |conn| {
            sweep_in(conn, channel, horizon)?;
            members_in(conn, channel)
        })
    }

    fn upsert_and_capture_predecessors(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<UpsertOutcome> {
        self.atomically("sqlite upsert", |conn| {
            sweep_in(conn, channel, horizon)?;
            upsert_in(conn, channel, identity, score)
        })
    }

    fn remove_and_capture_front_successor(
        &self,
        channel: &str,
        identity: &Identity,
        horizon: f64,
    ) -> Result<FrontChange> {
        self.atomically("sqlite remove", |conn| {
            sweep_in(conn, channel, horizon)?;
            remove_in(conn, channel, identity)
        })
    }

    fn requeue(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<(FrontChange, UpsertOutcome)> {
        self.atomically("sqlite requeue", |conn| {
            sweep_in(conn, channel, horizon)?;
            let front = remove_in(conn, channel, identity)?;
            let upsert = upsert_in(conn, channel, identity, score)?;
            Ok((front, upsert))
        })
    }

    fn rank_zero(&self, channel: &str, identity: &Identity, horizon: f64) -> Result<bool> {
        self.atomically("sqlite rank zero", |conn| {
            sweep_in(conn, channel, horizon)?;
            Ok(front_in(conn, channel)?.as_ref() == Some(identity))
        })
    }

    fn clear(&self, channel: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM stack_members WHERE channel = ?1", params![channel])
            .map_err(|e| Error::store("sqlite clear", e))?;
        Ok(())
    }

    fn channels(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT channel FROM stack_members ORDER BY channel")
            .map_err(|e| Error::store("sqlite prepare channels", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::store("sqlite query channels", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::store("sqlite read channels", e))
    }
}

impl LegacyStore for SqliteStore {
    fn legacy_channels(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT channel FROM legacy_stacks ORDER BY channel")
            .map_err(|e| Error::store("sqlite prepare legacy channels", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::store("sqlite query legacy channels", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::store("sqlite read legacy channels", e))
    }

    fn read_legacy(&self, channel: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT entry FROM legacy_stacks WHERE channel = ?1 ORDER BY position ASC")
            .map_err(|e| Error::store("sqlite prepare legacy", e))?;
        let rows = stmt
            .query_map(params![channel], |row| row.get::<_, String>(0))
            .map_err(|e| Error::store("sqlite query legacy", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::store("sqlite read legacy", e))
    }

    fn push_legacy(&self, channel: &str, entry: &str) -> Result<()> {
        self.atomically("sqlite push legacy", |conn| {
            conn.execute(
                "INSERT INTO legacy_stacks (channel, position, entry)
                 SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2 FROM legacy_stacks WHERE channel = ?1",
                params![channel, entry],
            )
            .map_err(|e| Error::store("sqlite push legacy", e))?;
            Ok(())
        })
    }

    fn replace_legacy(&self, channel: &str, entries: &[(Identity, f64)]) -> Result<()> {
        self.atomically("sqlite replace legacy", |conn| {
            let existing: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM stack_members WHERE channel = ?1",
                    params![channel],
                    |row| row.get(0),
                )
                .map_err(|e| Error::store("sqlite count members", e))?;
            if existing > 0 {
                return Err(Error::MigrationConflict {
                    channel: channel.to_string(),
                    reason: format!("{} scored member(s) already present", existing),
                });
            }

            conn.execute("DELETE FROM legacy_stacks WHERE channel = ?1", params![channel])
                .map_err(|e| Error::store("sqlite delete legacy", e))?;

            let mut insert = conn
                .prepare_cached(
                    "INSERT INTO stack_members (channel, identity, score) VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| Error::store("sqlite prepare migrate", e))?;
            for (identity, score) in entries {
                insert
                    .execute(params![channel, identity.as_str(), score])
                    .map_err(|e| Error::store("sqlite migrate member", e))?;
            }
            Ok(())
        })
    }

    fn support_marker(&self) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM support_markers WHERE key = ?1",
                params![SUPPORT_KEY],
                |row| row.get(0),
            )
            .map_err(|e| Error::store("sqlite read marker", e))?;
        Ok(count > 0)
    }

    fn set_support_marker(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO support_markers (key, value) VALUES (?1, 1)
             ON CONFLICT(key) DO UPDATE SET value = value + 1",
            params![SUPPORT_KEY],
        )
        .map_err(|e| Error::store("sqlite set marker", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("stacks.db"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_upsert_orders_by_score() {
        let dir = TempDir::new().unwrap();
        conformance::upsert_orders_by_score(&open(&dir));
    }

    #[test]
    fn test_upsert_moves_existing_to_back() {
        let dir = TempDir::new().unwrap();
        conformance::upsert_moves_existing_to_back(&open(&dir));
    }

    #[test]
    fn test_ties_break_by_identity() {
        let dir = TempDir::new().unwrap();
        conformance::ties_break_by_identity(&open(&dir));
    }

    #[test]
    fn test_remove_reports_front_succession() {
        let dir = TempDir::new().unwrap();
        conformance::remove_reports_front_succession(&open(&dir));
    }

    #[test]
    fn test_expired_entries_never_count() {
        let dir = TempDir::new().unwrap();
        conformance::expired_entries_never_count(&open(&dir));
    }

    #[test]
    fn test_requeue_is_one_step() {
        let dir = TempDir::new().unwrap();
        conformance::requeue_is_one_step(&open(&dir));
    }

    #[test]
    fn test_clear_and_channels() {
        let dir = TempDir::new().unwrap();
        conformance::clear_and_channels(&open(&dir));
    }

    #[test]
    fn test_legacy_roundtrip() {
        let dir = TempDir::new().unwrap();
        conformance::legacy_roundtrip(&open(&dir));
    }

    #[test]
    fn test_legacy_conflict_leaves_data() {
        let dir = TempDir::new().unwrap();
        conformance::legacy_conflict_leaves_data(&open(&dir));
    }

    #[test]
    fn test_concurrent_joins_stay_unique() {
        let dir = TempDir::new().unwrap();
        conformance::concurrent_joins_stay_unique(Arc::new(open(&dir)));
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store
                .upsert_and_capture_predecessors("room", &Identity::new("a"), 1.0, 0.0)
                .unwrap();
            store.set_support_marker().unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.snapshot("room", 0.0).unwrap(), vec![Identity::new("a")]);
        assert!(store.support_marker().unwrap());
    }
}
