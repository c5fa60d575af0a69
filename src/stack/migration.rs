//! One-shot upgrade of legacy list stacks to scored sets.
//!
//! Legacy stacks were plain append-only lists of display names, possibly
//! with duplicates. Each list is deduplicated (first occurrence wins),
//! resolved to identities, and rewritten as a scored set whose scores sit a
//! little inside the live expiry window, so old stacks age out soon after the
//! upgrade instead of lingering.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::store::{score_at, Identity, Store};

use super::subject::Directory;

/// Proof that the store no longer holds unmigrated legacy stacks.
///
/// Only [`Migrator::ensure`] hands these out.
#[derive(Debug)]
pub struct Migrated {
    _private: (),
}

/// What a migration run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// The support marker was already present; nothing was touched.
    pub already_migrated: bool,
    pub channels_migrated: usize,
    pub entries_migrated: usize,
    pub duplicates_dropped: usize,
    /// Raw names the directory could not resolve.
    pub unresolved: Vec<String>,
    /// Channels skipped because they already held scored members.
    pub conflicts: Vec<String>,
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.already_migrated {
            return write!(f, "Store already migrated");
        }
        write!(
            f,
            "Migrated {} channel(s), {} member(s); dropped {} duplicate(s), {} unresolved; {} conflict(s)",
            self.channels_migrated,
            self.entries_migrated,
            self.duplicates_dropped,
            self.unresolved.len(),
            self.conflicts.len()
        )
    }
}

/// Deduplicated, resolved form of one legacy list.
#[derive(Debug, Default, PartialEq, Eq)]
struct ChannelPlan {
    members: Vec<Identity>,
    duplicates: usize,
    unresolved: Vec<String>,
}

fn plan_channel(raw: &[String], directory: &dyn Directory) -> ChannelPlan {
    let mut plan = ChannelPlan::default();
    let mut seen_names = HashSet::new();
    let mut seen_ids = HashSet::new();

    for name in raw {
        if !seen_names.insert(name.as_str()) {
            plan.duplicates += 1;
            continue;
        }
        match directory.resolve(name) {
            Some(identity) => {
                if seen_ids.insert(identity.clone()) {
                    plan.members.push(identity);
                } else {
                    plan.duplicates += 1;
                }
            }
            None => plan.unresolved.push(name.clone()),
        }
    }
    plan
}

/// Runs the legacy upgrade once per installation.
pub struct Migrator {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    window: Duration,
    offset: f64,
}

impl Migrator {
    /// `window` must be shorter than the live expiry timeout; `offset` spaces
    /// consecutive scores.
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, window: Duration, offset: f64) -> Self {
        Self {
            store,
            directory,
            window,
            offset,
        }
    }

    pub fn from_settings(store: Arc<dyn Store>, directory: Arc<dyn Directory>, settings: &Settings) -> Self {
        Self::new(
            store,
            directory,
            settings.migration_timeout(),
            settings.migration.offset,
        )
    }

    /// Migrate every legacy channel unless the support marker says it is done.
    ///
    /// A conflicting channel is logged and skipped. Store failures abort the
    /// run before the marker is written, so the next start retries.
    pub fn ensure(&self, now: DateTime<Utc>) -> Result<(Migrated, MigrationReport)> {
        if self.store.support_marker()? {
            tracing::debug!("Support marker present, skipping legacy migration");
            let report = MigrationReport {
                already_migrated: true,
                ..Default::default()
            };
            return Ok((Migrated { _private: () }, report));
        }

        let mut report = MigrationReport::default();
        for channel in self.store.legacy_channels()? {
            match self.migrate_channel(&channel, now, &mut report) {
                Ok(()) => {}
                Err(Error::MigrationConflict { channel, reason }) => {
                    tracing::warn!("Skipping legacy stack {}: {}", channel, reason);
                    report.conflicts.push(channel);
                }
                Err(e) => return Err(e),
            }
        }

        self.store.set_support_marker()?;
        tracing::info!("{}", report);
        Ok((Migrated { _private: () }, report))
    }

    fn migrate_channel(&self, channel: &str, now: DateTime<Utc>, report: &mut MigrationReport) -> Result<()> {
        let raw = self.store.read_legacy(channel)?;
        let plan = plan_channel(&raw, self.directory.as_ref());

        for name in &plan.unresolved {
            tracing::warn!("Dropping unresolvable legacy entry {:?} in {}", name, channel);
        }

        let base = score_at(now) - self.window.as_secs_f64();
        let entries: Vec<(Identity, f64)> = plan
            .members
            .iter()
            .enumerate()
            .map(|(i, identity)| (identity.clone(), base + self.offset * i as f64))
            .collect();

        self.store.replace_legacy(channel, &entries)?;
        tracing::info!(
            "Migrated legacy stack {}: {} member(s) from {} entries",
            channel,
            entries.len(),
            raw.len()
        );

        report.channels_migrated += 1;
        report.entries_migrated += entries.len();
        report.duplicates_dropped += plan.duplicates;
        report.unresolved.extend(plan.unresolved);
        Ok(())
    }
}
