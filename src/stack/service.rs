//! Queue service - stack rules on top of the membership store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::store::{horizon, score_at, FrontChange, Identity, Store, UpsertOutcome};

use super::migration::Migrated;

/// Result of joining a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Nobody else is on the stack; the member has the floor.
    First,
    /// The member is behind `predecessors` (in queue order).
    Inserted {
        predecessors: Vec<Identity>,
        /// The member was already on the stack and went to the back.
        moved: bool,
        /// Set when the member held the front before re-joining.
        new_front: Option<Identity>,
    },
}

impl JoinOutcome {
    fn from_upsert(upsert: UpsertOutcome, was_front: bool) -> Self {
        let UpsertOutcome {
            predecessors,
            replaced,
        } = upsert;

        let Some(first) = predecessors.first().cloned() else {
            return JoinOutcome::First;
        };
        JoinOutcome::Inserted {
            new_front: (was_front && replaced).then_some(first),
            predecessors,
            moved: replaced,
        }
    }
}

/// Result of leaving a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The member held the floor; this member has it now.
    BecameFront(Identity),
    /// The member held the floor and the stack is now empty.
    NowEmpty,
    /// The front did not change (including when the member was absent).
    NoFrontChange,
}

impl From<FrontChange> for LeaveOutcome {
    fn from(change: FrontChange) -> Self {
        match change {
            FrontChange::Succeeded(next) => LeaveOutcome::BecameFront(next),
            FrontChange::Emptied => LeaveOutcome::NowEmpty,
            FrontChange::Unchanged => LeaveOutcome::NoFrontChange,
        }
    }
}

/// Result of a requeue: what leaving and re-joining each reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueOutcome {
    pub left: LeaveOutcome,
    pub joined: JoinOutcome,
}

/// Result of looking at a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeekOutcome {
    Empty,
    Members(Vec<Identity>),
}

/// Per-channel stack operations.
///
/// Construction requires the token handed out by the legacy migration, so no
/// traffic reaches the store before it has been upgraded.
pub struct QueueService {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl QueueService {
    pub fn new(store: Arc<dyn Store>, timeout: Duration, _migrated: Migrated) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn horizon(&self, now: DateTime<Utc>) -> f64 {
        horizon(score_at(now), self.timeout)
    }

    /// Join the stack, or move to its back when already on it.
    pub fn join(&self, channel: &str, identity: &Identity, now: DateTime<Utc>) -> Result<JoinOutcome> {
        let horizon = self.horizon(now);
        self.store.sweep(channel, horizon)?;

        let was_front = self.store.rank_zero(channel, identity, horizon)?;
        let upsert = self
            .store
            .upsert_and_capture_predecessors(channel, identity, score_at(now), horizon)?;

        let outcome = JoinOutcome::from_upsert(upsert, was_front);
        tracing::debug!(channel, member = %identity, ?outcome, "join");
        Ok(outcome)
    }

    /// Leave the stack. Leaving when absent is a no-op.
    pub fn leave(&self, channel: &str, identity: &Identity, now: DateTime<Utc>) -> Result<LeaveOutcome> {
        let horizon = self.horizon(now);
        self.store.sweep(channel, horizon)?;

        let outcome = LeaveOutcome::from(
            self.store
                .remove_and_capture_front_successor(channel, identity, horizon)?,
        );
        tracing::debug!(channel, member = %identity, ?outcome, "leave");
        Ok(outcome)
    }

    /// Leave and re-join as a single atomic store step.
    pub fn requeue(&self, channel: &str, identity: &Identity, now: DateTime<Utc>) -> Result<RequeueOutcome> {
        let horizon = self.horizon(now);
        let (front, upsert) = self
            .store
            .requeue(channel, identity, score_at(now), horizon)?;

        let outcome = RequeueOutcome {
            left: LeaveOutcome::from(front),
            joined: JoinOutcome::from_upsert(upsert, false),
        };
        tracing::debug!(channel, member = %identity, ?outcome, "requeue");
        Ok(outcome)
    }

    /// Current stack in queue order.
    pub fn peek(&self, channel: &str, now: DateTime<Utc>) -> Result<PeekOutcome> {
        let members = self.store.snapshot(channel, self.horizon(now))?;
        if members.is_empty() {
            Ok(PeekOutcome::Empty)
        } else {
            Ok(PeekOutcome::Members(members))
        }
    }

    pub fn clear(&self, channel: &str) -> Result<()> {
        self.store.clear(channel)?;
        tracing::info!(channel, "stack cleared");
        Ok(())
    }

    /// Drop expired members; returns how many were removed.
    pub fn sweep(&self, channel: &str, now: DateTime<Utc>) -> Result<usize> {
        self.store.sweep(channel, self.horizon(now))
    }
}
