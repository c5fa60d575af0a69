//! Telegram bot client - simple polling version.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::BotCommand;

use crate::core::Dispatcher;
use crate::error::Error;
use crate::stack::RosterDirectory;

use super::handler::handle_message;

/// Run the telegram bot using simple polling until interrupted.
pub async fn run_telegram_daemon(
    token: String,
    dispatcher: Arc<Dispatcher>,
    roster: Arc<RosterDirectory>,
) -> Result<(), Error> {
    tracing::info!("Starting Telegram bot...");

    let bot = Bot::new(token);
    let me = bot
        .get_me()
        .await
        .map_err(|e| Error::Telegram(format!("token rejected: {}", e)))?;
    tracing::info!("Logged in as @{}", me.username());

    if let Err(e) = bot
        .set_my_commands(vec![
            BotCommand::new("stack", "Join the stack (stack show|list|clear|help)"),
            BotCommand::new("unstack", "Leave the stack"),
            BotCommand::new("restack", "Move to the back of the stack"),
            BotCommand::new("stacks", "Show or clear the stack"),
        ])
        .await
    {
        tracing::warn!("Failed to set commands: {}", e);
    }

    tracing::info!("Telegram bot commands set");

    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let dispatcher = dispatcher.clone();
        let roster = roster.clone();
        async move { handle_message(bot, msg, dispatcher, roster).await }
    })
    .await;

    tracing::info!("Telegram bot stopped");
    Ok(())
}
