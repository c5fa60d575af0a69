//! Ordered membership store - per-channel scored sets with atomic compound operations.
//!
//! Every operation that reads or mutates a channel first sweeps entries whose
//! score is below the supplied horizon, inside the same atomic step, so
//! expired members never influence a decision.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Settings, StoreBackend};
use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Marker recording that legacy lists were converted to scored sets.
pub const SUPPORT_KEY: &str = "support:scored-sets";

/// Stable participant token. Never raw display text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Identity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to the front of a channel when a member was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontChange {
    /// The removed member was not at the front (or was not present).
    Unchanged,
    /// The removed member held the front; this member holds it now.
    Succeeded(Identity),
    /// The removed member held the front and nobody is left.
    Emptied,
}

/// Result of an upsert: membership ahead of the member, captured atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Every other member in queue order, as seen right before the write.
    pub predecessors: Vec<Identity>,
    /// Whether the member was already present and got moved.
    pub replaced: bool,
}

/// Atomic primitives over per-channel scored sets.
///
/// Calls may block on the engine; callers must not hold in-process locks
/// across them. Compound operations are linearizable per channel.
pub trait MembershipStore: Send + Sync {
    /// Remove every entry with `score < horizon`. Returns how many went.
    fn sweep(&self, channel: &str, horizon: f64) -> Result<usize>;

    /// Members in ascending score order.
    fn snapshot(&self, channel: &str, horizon: f64) -> Result<Vec<Identity>>;

    /// Read everyone but `identity`, then set `identity`'s score, as one step.
    fn upsert_and_capture_predecessors(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<UpsertOutcome>;

    /// Remove `identity`, reporting who took over if it held the front.
    fn remove_and_capture_front_successor(
        &self,
        channel: &str,
        identity: &Identity,
        horizon: f64,
    ) -> Result<FrontChange>;

    /// Remove then re-insert `identity` at `score` in a single step.
    fn requeue(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<(FrontChange, UpsertOutcome)>;

    /// Whether `identity` currently holds the front.
    fn rank_zero(&self, channel: &str, identity: &Identity, horizon: f64) -> Result<bool>;

    /// Delete the channel's set.
    fn clear(&self, channel: &str) -> Result<()>;

    /// Channels holding at least one (possibly expired) member.
    fn channels(&self) -> Result<Vec<String>>;
}

/// Access to the pre-migration list representation and the support marker.
pub trait LegacyStore: Send + Sync {
    /// Channels that still have a legacy list.
    fn legacy_channels(&self) -> Result<Vec<String>>;

    /// Raw legacy entries in insertion order.
    fn read_legacy(&self, channel: &str) -> Result<Vec<String>>;

    /// Append a raw entry to a legacy list.
    fn push_legacy(&self, channel: &str, entry: &str) -> Result<()>;

    /// Delete the legacy list and write the scored set in one step.
    ///
    /// Fails with `MigrationConflict` if the channel already holds scored
    /// members; nothing is changed in that case.
    fn replace_legacy(&self, channel: &str, entries: &[(Identity, f64)]) -> Result<()>;

    fn support_marker(&self) -> Result<bool>;

    fn set_support_marker(&self) -> Result<()>;
}

/// Everything the service and the migration need from one engine.
pub trait Store: MembershipStore + LegacyStore {}

impl<T: MembershipStore + LegacyStore> Store for T {}

/// Open the configured store engine.
pub fn open_store(settings: &Settings) -> Result<Arc<dyn Store>> {
    match settings.store.backend {
        StoreBackend::Sqlite => {
            let path = settings.store_path()?;
            let busy_timeout = Duration::from_millis(settings.store.busy_timeout_ms);
            tracing::info!("Opening sqlite store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(path, busy_timeout)?))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-process store; stacks will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Convert a wall-clock instant to a score.
pub fn score_at(now: chrono::DateTime<chrono::Utc>) -> f64 {
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Score below which entries are expired.
pub fn horizon(now: f64, timeout: Duration) -> f64 {
    now - timeout.as_secs_f64()
}

/// Engine wrapper whose writes fail on demand.
#[cfg(test)]
pub(crate) mod failing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::Error;

    #[derive(Debug, Default)]
    pub struct FailingStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl FailingStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn break_writes(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }

        fn check(&self, op: &str) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable(format!("{}: connection refused", op)));
            }
            Ok(())
        }
    }

    impl MembershipStore for FailingStore {
        fn sweep(&self, channel: &str, horizon: f64) -> Result<usize> {
            self.check("sweep")?;
            self.inner.sweep(channel, horizon)
        }

        fn snapshot(&self, channel: &str, horizon: f64) -> Result<Vec<Identity>> {
            self.inner.snapshot(channel, horizon)
        }

        fn upsert_and_capture_predecessors(
            &self,
            channel: &str,
            identity: &Identity,
            score: f64,
            horizon: f64,
        ) -> Result<UpsertOutcome> {
            self.check("upsert")?;
            self.inner
                .upsert_and_capture_predecessors(channel, identity, score, horizon)
        }

        fn remove_and_capture_front_successor(
            &self,
            channel: &str,
            identity: &Identity,
            horizon: f64,
        ) -> Result<FrontChange> {
            self.check("remove")?;
            self.inner
                .remove_and_capture_front_successor(channel, identity, horizon)
        }

        fn requeue(
            &self,
            channel: &str,
            identity: &Identity,
            score: f64,
            horizon: f64,
        ) -> Result<(FrontChange, UpsertOutcome)> {
            self.check("requeue")?;
            self.inner.requeue(channel, identity, score, horizon)
        }

        fn rank_zero(&self, channel: &str, identity: &Identity, horizon: f64) -> Result<bool> {
            self.inner.rank_zero(channel, identity, horizon)
        }

        fn clear(&self, channel: &str) -> Result<()> {
            self.check("clear")?;
            self.inner.clear(channel)
        }

        fn channels(&self) -> Result<Vec<String>> {
            self.inner.channels()
        }
    }

    impl LegacyStore for FailingStore {
        fn legacy_channels(&self) -> Result<Vec<String>> {
            self.inner.legacy_channels()
        }

        fn read_legacy(&self, channel: &str) -> Result<Vec<String>> {
            self.inner.read_legacy(channel)
        }

        fn push_legacy(&self, channel: &str, entry: &str) -> Result<()> {
            self.inner.push_legacy(channel, entry)
        }

        fn replace_legacy(&self, channel: &str, entries: &[(Identity, f64)]) -> Result<()> {
            self.check("replace legacy")?;
            self.inner.replace_legacy(channel, entries)
        }

        fn support_marker(&self) -> Result<bool> {
            self.inner.support_marker()
        }

        fn set_support_marker(&self) -> Result<()> {
            self.check("set support marker")?;
            self.inner.set_support_marker()
        }
    }
}

/// Shared behaviour checks run against every engine.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    fn ids(list: &[&str]) -> Vec<Identity> {
        list.iter().map(|s| id(s)).collect()
    }

    pub fn upsert_orders_by_score(store: &dyn Store) {
        let out = store
            .upsert_and_capture_predecessors("room", &id("trillian"), 10.0, 0.0)
            .unwrap();
        assert!(out.predecessors.is_empty());
        assert!(!out.replaced);

        let out = store
            .upsert_and_capture_predecessors("room", &id("zaphod"), 11.0, 0.0)
            .unwrap();
        assert_eq!(out.predecessors, ids(&["trillian"]));

        let out = store
            .upsert_and_capture_predecessors("room", &id("ford"), 12.0, 0.0)
            .unwrap();
        assert_eq!(out.predecessors, ids(&["trillian", "zaphod"]));

        assert_eq!(
            store.snapshot("room", 0.0).unwrap(),
            ids(&["trillian", "zaphod", "ford"])
        );
    }

    pub fn upsert_moves_existing_to_back(store: &dyn Store) {
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            store
                .upsert_and_capture_predecessors("room", &id(name), i as f64 + 1.0, 0.0)
                .unwrap();
        }
        let out = store
            .upsert_and_capture_predecessors("room", &id("a"), 5.0, 0.0)
            .unwrap();
        assert!(out.replaced);
        assert_eq!(out.predecessors, ids(&["b", "c"]));
        assert_eq!(store.snapshot("room", 0.0).unwrap(), ids(&["b", "c", "a"]));
    }

    pub fn ties_break_by_identity(store: &dyn Store) {
        store
            .upsert_and_capture_predecessors("room", &id("marvin"), 7.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("arthur"), 7.0, 0.0)
            .unwrap();
        assert_eq!(store.snapshot("room", 0.0).unwrap(), ids(&["arthur", "marvin"]));
    }

    pub fn remove_reports_front_succession(store: &dyn Store) {
        store
            .upsert_and_capture_predecessors("room", &id("a"), 1.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("b"), 2.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("c"), 3.0, 0.0)
            .unwrap();

        assert_eq!(
            store
                .remove_and_capture_front_successor("room", &id("b"), 0.0)
                .unwrap(),
            FrontChange::Unchanged
        );
        assert_eq!(
            store
                .remove_and_capture_front_successor("room", &id("nobody"), 0.0)
                .unwrap(),
            FrontChange::Unchanged
        );
        assert_eq!(
            store
                .remove_and_capture_front_successor("room", &id("a"), 0.0)
                .unwrap(),
            FrontChange::Succeeded(id("c"))
        );
        assert_eq!(
            store
                .remove_and_capture_front_successor("room", &id("c"), 0.0)
                .unwrap(),
            FrontChange::Emptied
        );
        assert!(store.channels().unwrap().is_empty());
    }

    pub fn expired_entries_never_count(store: &dyn Store) {
        store
            .upsert_and_capture_predecessors("room", &id("old"), 1.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("fresh"), 100.0, 0.0)
            .unwrap();

        assert!(store.rank_zero("room", &id("old"), 0.0).unwrap());
        let out = store
            .upsert_and_capture_predecessors("room", &id("new"), 101.0, 50.0)
            .unwrap();
        assert_eq!(out.predecessors, ids(&["fresh"]));
        assert!(store.rank_zero("room", &id("fresh"), 50.0).unwrap());
        assert_eq!(store.snapshot("room", 50.0).unwrap(), ids(&["fresh", "new"]));

        assert_eq!(store.sweep("room", 1000.0).unwrap(), 2);
        assert!(store.snapshot("room", 1000.0).unwrap().is_empty());
        assert!(store.channels().unwrap().is_empty());
    }

    pub fn requeue_is_one_step(store: &dyn Store) {
        store
            .upsert_and_capture_predecessors("room", &id("a"), 1.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("b"), 2.0, 0.0)
            .unwrap();

        let (front, out) = store.requeue("room", &id("a"), 3.0, 0.0).unwrap();
        assert_eq!(front, FrontChange::Succeeded(id("b")));
        assert_eq!(out.predecessors, ids(&["b"]));
        assert!(!out.replaced);
        assert_eq!(store.snapshot("room", 0.0).unwrap(), ids(&["b", "a"]));

        let (front, out) = store.requeue("room", &id("solo"), 4.0, 0.0).unwrap();
        assert_eq!(front, FrontChange::Unchanged);
        assert_eq!(out.predecessors, ids(&["b", "a"]));
    }

    pub fn clear_and_channels(store: &dyn Store) {
        store
            .upsert_and_capture_predecessors("one", &id("a"), 1.0, 0.0)
            .unwrap();
        store
            .upsert_and_capture_predecessors("two", &id("b"), 1.0, 0.0)
            .unwrap();
        assert_eq!(store.channels().unwrap(), vec!["one".to_string(), "two".to_string()]);

        store.clear("one").unwrap();
        store.clear("never-existed").unwrap();
        assert!(store.snapshot("one", 0.0).unwrap().is_empty());
        assert_eq!(store.channels().unwrap(), vec!["two".to_string()]);
    }

    pub fn legacy_roundtrip(store: &dyn Store) {
        assert!(!store.support_marker().unwrap());
        for name in ["zaphod", "trillian", "zaphod"] {
            store.push_legacy("room", name).unwrap();
        }
        assert_eq!(store.legacy_channels().unwrap(), vec!["room".to_string()]);
        assert_eq!(
            store.read_legacy("room").unwrap(),
            vec!["zaphod".to_string(), "trillian".to_string(), "zaphod".to_string()]
        );

        store
            .replace_legacy("room", &[(id("1"), 5.0), (id("2"), 5.1)])
            .unwrap();
        assert!(store.legacy_channels().unwrap().is_empty());
        assert_eq!(store.snapshot("room", 0.0).unwrap(), ids(&["1", "2"]));

        store.set_support_marker().unwrap();
        store.set_support_marker().unwrap();
        assert!(store.support_marker().unwrap());
    }

    pub fn legacy_conflict_leaves_data(store: &dyn Store) {
        store.push_legacy("room", "zaphod").unwrap();
        store
            .upsert_and_capture_predecessors("room", &id("9"), 1.0, 0.0)
            .unwrap();

        let err = store.replace_legacy("room", &[(id("1"), 5.0)]).unwrap_err();
        assert!(matches!(err, crate::error::Error::MigrationConflict { .. }));
        assert_eq!(store.read_legacy("room").unwrap(), vec!["zaphod".to_string()]);
        assert_eq!(store.snapshot("room", 0.0).unwrap(), ids(&["9"]));
    }

    pub fn concurrent_joins_stay_unique(store: Arc<dyn Store>) {
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    let who = id(&format!("member-{}", (t + i) % 5));
                    store
                        .upsert_and_capture_predecessors("busy", &who, (t * 10 + i) as f64, 0.0)
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut members = store.snapshot("busy", 0.0).unwrap();
        assert_eq!(members.len(), 5);
        members.sort();
        members.dedup();
        assert_eq!(members.len(), 5);
    }
}
