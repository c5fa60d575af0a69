//! CLI commands for Stacker using clap.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_settings, load_settings_from, Settings, StoreBackend};
use crate::core::Dispatcher;
use crate::stack::{Directory, Migrator, PeekOutcome, QueueService, RosterDirectory};
use crate::store::{open_store, Store};
use crate::telegram::run_telegram_daemon;

/// Stacker - who has the floor, per chat room.
#[derive(Parser)]
#[command(name = "stacker")]
#[command(version)]
#[command(about = "Stacker - per-room floor queue for chat", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.stacker/settings.json)
    #[arg(long, global = true, env = "STACKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured store backend
    #[arg(long, global = true, value_enum)]
    pub backend: Option<StoreBackend>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Migrate legacy stacks, then run the Telegram bot
    Start {
        /// Telegram bot token (overrides settings)
        #[arg(long, env = "STACKER_TELEGRAM_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Run the legacy stack migration and exit
    Migrate,

    /// Show migration state and channels
    Status,

    /// Show a channel's stack
    Show {
        /// Channel key (Telegram chat id)
        channel: String,
    },

    /// Clear a channel's stack
    Clear {
        /// Channel key (Telegram chat id)
        channel: String,
    },

    /// Append a raw entry to a legacy list
    #[command(hide = true)]
    LegacyPush {
        channel: String,
        entry: String,
    },
}

impl Commands {
    /// Load settings, open the store and run the selected command.
    pub async fn run(self) -> Result<()> {
        let mut settings = match &self.config {
            Some(path) => load_settings_from(path)?,
            None => load_settings()?,
        };
        if let Some(backend) = self.backend {
            settings.store.backend = backend;
        }

        let store = open_store(&settings)?;
        let roster = Arc::new(RosterDirectory::from_config(&settings.directory));

        match self.command {
            Command::Start { token } => start(&settings, store, roster, token).await,
            Command::Migrate => {
                let migrator = Migrator::from_settings(store, roster, &settings);
                let (_, report) = migrator.ensure(Utc::now())?;
                println!("{}", report);
                Ok(())
            }
            Command::Status => status(store.as_ref()),
            Command::Show { channel } => {
                let service = open_service(&settings, store, roster.clone())?;
                match service.peek(&channel, Utc::now())? {
                    PeekOutcome::Empty => println!("The stack is empty!"),
                    PeekOutcome::Members(members) => {
                        for (idx, member) in members.iter().enumerate() {
                            println!("{}. {}", idx + 1, roster.mention(member));
                        }
                    }
                }
                Ok(())
            }
            Command::Clear { channel } => {
                let service = open_service(&settings, store, roster)?;
                service.clear(&channel)?;
                println!("Cleared stack in {}", channel);
                Ok(())
            }
            Command::LegacyPush { channel, entry } => {
                store.push_legacy(&channel, &entry)?;
                println!("Appended {} to legacy stack {}", entry, channel);
                Ok(())
            }
        }
    }
}

/// Run the migration (a no-op once done) and build the queue service.
fn open_service(
    settings: &Settings,
    store: Arc<dyn Store>,
    roster: Arc<RosterDirectory>,
) -> Result<QueueService> {
    let migrator = Migrator::from_settings(store.clone(), roster, settings);
    let (migrated, report) = migrator
        .ensure(Utc::now())
        .context("legacy stack migration failed")?;
    if !report.already_migrated {
        tracing::info!("{}", report);
    }
    Ok(QueueService::new(store, settings.timeout(), migrated))
}

async fn start(
    settings: &Settings,
    store: Arc<dyn Store>,
    roster: Arc<RosterDirectory>,
    token: Option<String>,
) -> Result<()> {
    let token = token
        .or_else(|| settings.telegram.bot_token.clone())
        .context("No Telegram bot token configured. Set telegram.bot_token or STACKER_TELEGRAM_TOKEN.")?;

    let service = Arc::new(open_service(settings, store, roster.clone())?);
    tracing::info!(
        "Stack service ready (timeout {}s)",
        service.timeout().as_secs()
    );

    let dispatcher = Arc::new(Dispatcher::new(service, roster.clone()));
    run_telegram_daemon(token, dispatcher, roster).await?;
    Ok(())
}

fn status(store: &dyn Store) -> Result<()> {
    let migrated = store.support_marker()?;
    println!(
        "Legacy migration: {}",
        if migrated { "done" } else { "pending" }
    );

    let legacy = store.legacy_channels()?;
    if !legacy.is_empty() {
        println!("Legacy stacks: {}", legacy.join(", "));
    }

    let channels = store.channels()?;
    if channels.is_empty() {
        println!("No active stacks");
    } else {
        println!("Active stacks: {}", channels.join(", "));
    }
    Ok(())
}
