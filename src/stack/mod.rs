//! Stack rules - who holds the floor in each channel.
//!
//! - Queue service (join, leave, requeue, peek, clear)
//! - Subject resolution and the participant directory
//! - One-shot legacy migration

pub mod migration;
pub mod service;
pub mod subject;

pub use migration::{Migrated, MigrationReport, Migrator};
pub use service::{JoinOutcome, LeaveOutcome, PeekOutcome, QueueService, RequeueOutcome};
pub use subject::{resolve_subject, Directory, RosterDirectory, Subject};
