//! Who a command is about, and how names become identities.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::Identity;

/// Subject of a stack command as it arrives from the command layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// Already a stable identity.
    Resolved(Identity),
    /// A name typed by a user, to be looked up in the directory.
    Unresolved(String),
    /// No subject given; the invoking participant is meant.
    Missing,
}

/// Name to identity lookup.
pub trait Directory: Send + Sync {
    /// Resolve a human-readable name (with or without `@`).
    fn resolve(&self, name: &str) -> Option<Identity>;

    /// How to mention an identity in a reply, e.g. `@zaphod`.
    fn mention(&self, identity: &Identity) -> String;
}

/// Resolve a subject once, at the service boundary.
pub fn resolve_subject(
    subject: &Subject,
    invoker: &Identity,
    directory: &dyn Directory,
) -> Result<Identity> {
    match subject {
        Subject::Resolved(identity) => Ok(identity.clone()),
        Subject::Missing => Ok(invoker.clone()),
        Subject::Unresolved(name) => directory
            .resolve(name)
            .ok_or_else(|| Error::IdentityNotFound(normalize_name(name))),
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_string()
}

#[derive(Debug, Default)]
struct Roster {
    by_name: HashMap<String, Identity>,
    names: HashMap<Identity, String>,
}

/// Directory of participants seen in chat, seeded from configuration.
///
/// Name lookups ignore case and a leading `@`.
#[derive(Debug, Default)]
pub struct RosterDirectory {
    roster: RwLock<Roster>,
}

impl RosterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `directory` settings section (name -> identity).
    pub fn from_config(entries: &HashMap<String, String>) -> Self {
        let directory = Self::new();
        for (name, identity) in entries {
            directory.learn(name, Identity::new(identity.clone()));
        }
        directory
    }

    /// Record (or refresh) the name a participant is known by.
    pub fn learn(&self, name: &str, identity: Identity) {
        let name = normalize_name(name);
        if name.is_empty() {
            return;
        }
        let Ok(mut roster) = self.roster.write() else {
            tracing::warn!("Roster lock poisoned; not learning {}", name);
            return;
        };

        if let Some(previous) = roster.names.insert(identity.clone(), name.clone()) {
            let key = previous.to_lowercase();
            // The old name may already belong to someone else.
            if key != name.to_lowercase() && roster.by_name.get(&key) == Some(&identity) {
                roster.by_name.remove(&key);
            }
        }
        if let Some(displaced) = roster.by_name.insert(name.to_lowercase(), identity.clone()) {
            if displaced != identity {
                roster.names.remove(&displaced);
            }
        }
    }
}

impl Directory for RosterDirectory {
    fn resolve(&self, name: &str) -> Option<Identity> {
        let key = normalize_name(name).to_lowercase();
        self.roster.read().ok()?.by_name.get(&key).cloned()
    }

    fn mention(&self, identity: &Identity) -> String {
        let name = self
            .roster
            .read()
            .ok()
            .and_then(|r| r.names.get(identity).cloned());
        format!("@{}", name.unwrap_or_else(|| identity.to_string()))
    }
}
