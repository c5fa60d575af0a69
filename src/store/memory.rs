//! In-process membership store with one lock per channel.
//!
//! The channel map is only locked long enough to fetch a channel's set;
//! compound operations then run under that set's own mutex, so channels never
//! wait on each other. A set that becomes empty is retired and dropped from
//! the map; a caller that raced for a retired set fetches a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

use super::{FrontChange, Identity, LegacyStore, MembershipStore, UpsertOutcome};

#[derive(Debug, Default)]
struct ChannelSet {
    /// Kept sorted by (score, identity).
    entries: Vec<(Identity, f64)>,
    retired: bool,
}

impl ChannelSet {
    fn sweep(&mut self, horizon: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, score)| *score >= horizon);
        before - self.entries.len()
    }

    fn members(&self) -> Vec<Identity> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    fn front(&self) -> Option<&Identity> {
        self.entries.first().map(|(id, _)| id)
    }

    fn upsert(&mut self, identity: &Identity, score: f64) -> UpsertOutcome {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| id != identity);
        let replaced = self.entries.len() != before;
        let predecessors = self.members();

        self.entries.push((identity.clone(), score));
        self.entries
            .sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        UpsertOutcome {
            predecessors,
            replaced,
        }
    }

    fn remove(&mut self, identity: &Identity) -> FrontChange {
        let was_front = self.front() == Some(identity);
        self.entries.retain(|(id, _)| id != identity);

        if !was_front {
            return FrontChange::Unchanged;
        }
        match self.front() {
            Some(next) => FrontChange::Succeeded(next.clone()),
            None => FrontChange::Emptied,
        }
    }
}

/// Non-durable store, used for tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: Mutex<HashMap<String, Arc<Mutex<ChannelSet>>>>,
    legacy: Mutex<HashMap<String, Vec<String>>>,
    marker: Mutex<u64>,
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::StoreUnavailable("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Mutex<ChannelSet>>>>> {
        self.channels.lock().map_err(poisoned)
    }

    /// Run `f` with exclusive access to one channel's set.
    fn with_channel<T, F>(&self, channel: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ChannelSet) -> Result<T>,
    {
        let mut f = Some(f);
        loop {
            let set = self.map()?.entry(channel.to_string()).or_default().clone();
            let mut guard = set.lock().map_err(poisoned)?;
            if guard.retired {
                continue;
            }

            let Some(f) = f.take() else {
                return Err(Error::Other("channel operation ran twice".to_string()));
            };
            let out = f(&mut *guard);

            if guard.entries.is_empty() {
                guard.retired = true;
                let mut map = self.map()?;
                if map.get(channel).is_some_and(|current| Arc::ptr_eq(current, &set)) {
                    map.remove(channel);
                }
            }
            return out;
        }
    }
}

impl MembershipStore for MemoryStore {
    fn sweep(&self, channel: &str, horizon: f64) -> Result<usize> {
        self.with_channel(channel, |set| Ok(set.sweep(horizon)))
    }

    fn snapshot(&self, channel: &str, horizon: f64) -> Result<Vec<Identity>> {
        self.with_channel(channel, |set| {
            set.sweep(horizon);
            Ok(set.members())
        })
    }

    fn upsert_and_capture_predecessors(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<UpsertOutcome> {
        self.with_channel(channel, |set| {
            set.sweep(horizon);
            Ok(set.upsert(identity, score))
        })
    }

    fn remove_and_capture_front_successor(
        &self,
        channel: &str,
        identity: &Identity,
        horizon: f64,
    ) -> Result<FrontChange> {
        self.with_channel(channel, |set| {
            set.sweep(horizon);
            Ok(set.remove(identity))
        })
    }

    fn requeue(
        &self,
        channel: &str,
        identity: &Identity,
        score: f64,
        horizon: f64,
    ) -> Result<(FrontChange, UpsertOutcome)> {
        self.with_channel(channel, |set| {
            set.sweep(horizon);
            let front = set.remove(identity);
            Ok((front, set.upsert(identity, score)))
        })
    }

    fn rank_zero(&self, channel: &str, identity: &Identity, horizon: f64) -> Result<bool> {
        self.with_channel(channel, |set| {
            set.sweep(horizon);
            Ok(set.front() == Some(identity))
        })
    }

    fn clear(&self, channel: &str) -> Result<()> {
        self.with_channel(channel, |set| {
            set.entries.clear();
            Ok(())
        })
    }

    fn channels(&self) -> Result<Vec<String>> {
        let mut channels: Vec<String> = self.map()?.keys().cloned().collect();
        channels.sort();
        Ok(channels)
    }
}

impl LegacyStore for MemoryStore {
    fn legacy_channels(&self) -> Result<Vec<String>> {
        let legacy = self.legacy.lock().map_err(poisoned)?;
        let mut channels: Vec<String> = legacy.keys().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    fn read_legacy(&self, channel: &str) -> Result<Vec<String>> {
        let legacy = self.legacy.lock().map_err(poisoned)?;
        Ok(legacy.get(channel).cloned().unwrap_or_default())
    }

    fn push_legacy(&self, channel: &str, entry: &str) -> Result<()> {
        let mut legacy = self.legacy.lock().map_err(poisoned)?;
        legacy
            .entry(channel.to_string())
            .or_default()
            .push(entry.to_string());
        Ok(())
    }

    fn replace_legacy(&self, channel: &str, entries: &[(Identity, f64)]) -> Result<()> {
        let mut legacy = self.legacy.lock().map_err(poisoned)?;

        self.with_channel(channel, |set| {
            if !set.entries.is_empty() {
                return Err(Error::MigrationConflict {
                    channel: channel.to_string(),
                    reason: format!("{} scored member(s) already present", set.entries.len()),
                });
            }
            for (identity, score) in entries {
                set.upsert(identity, *score);
            }
            Ok(())
        })?;

        legacy.remove(channel);
        Ok(())
    }

    fn support_marker(&self) -> Result<bool> {
        Ok(*self.marker.lock().map_err(poisoned)? > 0)
    }

    fn set_support_marker(&self) -> Result<()> {
        *self.marker.lock().map_err(poisoned)? += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_upsert_orders_by_score() {
        conformance::upsert_orders_by_score(&MemoryStore::new());
    }

    #[test]
    fn test_upsert_moves_existing_to_back() {
        conformance::upsert_moves_existing_to_back(&MemoryStore::new());
    }

    #[test]
    fn test_ties_break_by_identity() {
        conformance::ties_break_by_identity(&MemoryStore::new());
    }

    #[test]
    fn test_remove_reports_front_succession() {
        conformance::remove_reports_front_succession(&MemoryStore::new());
    }

    #[test]
    fn test_expired_entries_never_count() {
        conformance::expired_entries_never_count(&MemoryStore::new());
    }

    #[test]
    fn test_requeue_is_one_step() {
        conformance::requeue_is_one_step(&MemoryStore::new());
    }

    #[test]
    fn test_clear_and_channels() {
        conformance::clear_and_channels(&MemoryStore::new());
    }

    #[test]
    fn test_legacy_roundtrip() {
        conformance::legacy_roundtrip(&MemoryStore::new());
    }

    #[test]
    fn test_legacy_conflict_leaves_data() {
        conformance::legacy_conflict_leaves_data(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_joins_stay_unique() {
        conformance::concurrent_joins_stay_unique(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn test_reads_leave_no_empty_sets() {
        let store = MemoryStore::new();
        store.snapshot("ghost", 0.0).unwrap();
        store
            .remove_and_capture_front_successor("ghost", &Identity::new("x"), 0.0)
            .unwrap();
        assert!(store.map().unwrap().is_empty());
    }
}
