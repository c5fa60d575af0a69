//! Stacker library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod stack;
pub mod store;
pub mod telegram;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use self::core::{Dispatcher, Invocation, StackCommand};
pub use error::{Error, Result};
pub use stack::{Directory, Migrator, QueueService, RosterDirectory, Subject};
pub use store::{open_store, Identity, MembershipStore, Store};
pub use telegram::run_telegram_daemon;
