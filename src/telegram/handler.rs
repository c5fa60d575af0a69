//! Telegram message handling.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::Message;
use tokio::task::JoinError;

use crate::core::{Dispatcher, Invocation};
use crate::stack::RosterDirectory;
use crate::store::Identity;

const FAILURE_REPLY: &str = "Sorry, I couldn't update the stack right now. Please try again.";

/// Build an invocation from a Telegram message, recording the sender in the
/// roster on the way. Messages without text or sender are skipped.
pub fn invocation_from(msg: &Message, roster: &RosterDirectory) -> Option<Invocation> {
    let text = msg.text()?;
    let user = msg.from.as_ref()?;

    let sender = Identity::new(user.id.0.to_string());
    // Without a username the numeric id is the only handle that resolves.
    let handle = user.username.clone().unwrap_or_else(|| sender.to_string());
    roster.learn(&handle, sender.clone());

    let channel = if msg.chat.is_private() {
        None
    } else {
        Some(msg.chat.id.0.to_string())
    };

    Some(Invocation {
        channel,
        sender,
        text: text.to_string(),
        at: chrono::Utc::now(),
    })
}

/// Handle an incoming message: dispatch it off the async runtime and send
/// each reply as its own message.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    dispatcher: Arc<Dispatcher>,
    roster: Arc<RosterDirectory>,
) -> Result<(), teloxide::RequestError> {
    let Some(invocation) = invocation_from(&msg, &roster) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    let result = tokio::task::spawn_blocking(move || dispatcher.handle(&invocation)).await;
    let replies = replies_for(result, chat_id.0);

    for reply in replies {
        bot.send_message(chat_id, reply).await?;
    }
    Ok(())
}

/// Every failure, including a panicked dispatch task, gets exactly one reply.
fn replies_for(result: Result<crate::error::Result<Vec<String>>, JoinError>, chat_id: i64) -> Vec<String> {
    match result {
        Ok(Ok(replies)) => replies,
        Ok(Err(e)) => {
            tracing::error!("Stack command failed in chat {}: {}", chat_id, e);
            vec![FAILURE_REPLY.to_string()]
        }
        Err(e) => {
            tracing::error!("Stack command task failed in chat {}: {}", chat_id, e);
            vec![FAILURE_REPLY.to_string()]
        }
    }
}
