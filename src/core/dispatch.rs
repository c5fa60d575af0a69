//! Command dispatch - turns chat messages into stack operations and replies.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stack::{
    resolve_subject, Directory, JoinOutcome, LeaveOutcome, PeekOutcome, QueueService, Subject,
};
use crate::store::Identity;

use super::commands::{parse_command, StackCommand, HELP_TEXT};

/// One inbound chat message, already stripped of transport details.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Channel the message arrived in; `None` for private chats.
    pub channel: Option<String>,
    pub sender: Identity,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Routes stack commands to the queue service and formats the replies.
pub struct Dispatcher {
    service: Arc<QueueService>,
    directory: Arc<dyn Directory>,
}

impl Dispatcher {
    pub fn new(service: Arc<QueueService>, directory: Arc<dyn Directory>) -> Self {
        Self { service, directory }
    }

    /// Handle a message, returning the replies to send (possibly none).
    ///
    /// Resolution failures become a single reply. Store failures are returned
    /// to the caller untouched.
    pub fn handle(&self, invocation: &Invocation) -> Result<Vec<String>> {
        let Some(command) = parse_command(&invocation.text) else {
            return Ok(Vec::new());
        };

        match self.execute(&command, invocation) {
            Ok(replies) => Ok(replies),
            Err(Error::UnsupportedContext) => {
                tracing::debug!("Ignoring {:?} outside a channel", command);
                Ok(Vec::new())
            }
            Err(Error::IdentityNotFound(name)) => {
                tracing::info!("Could not resolve @{} for {:?}", name, command);
                Ok(vec![format!("I couldn't find @{} to {}.", name, command.action())])
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&self, command: &StackCommand, invocation: &Invocation) -> Result<Vec<String>> {
        let channel = invocation
            .channel
            .as_deref()
            .ok_or(Error::UnsupportedContext)?;
        let now = invocation.at;

        let subject = match command.subject() {
            Some(name) => Subject::Unresolved(name.to_string()),
            None => Subject::Missing,
        };

        match command {
            StackCommand::Join(_) => {
                let who = resolve_subject(&subject, &invocation.sender, self.directory.as_ref())?;
                let outcome = self.service.join(channel, &who, now)?;
                Ok(self.join_replies(&who, &outcome))
            }
            StackCommand::Leave(_) => {
                let who = resolve_subject(&subject, &invocation.sender, self.directory.as_ref())?;
                let outcome = self.service.leave(channel, &who, now)?;
                Ok(vec![self.leave_reply(&who, &outcome)])
            }
            StackCommand::Requeue(_) => {
                let who = resolve_subject(&subject, &invocation.sender, self.directory.as_ref())?;
                let outcome = self.service.requeue(channel, &who, now)?;
                let mut replies = vec![self.leave_reply(&who, &outcome.left)];
                replies.extend(self.join_replies(&who, &outcome.joined));
                Ok(replies)
            }
            StackCommand::Peek => Ok(vec![self.peek_reply(&self.service.peek(channel, now)?)]),
            StackCommand::Clear => {
                self.service.clear(channel)?;
                Ok(vec![format!(
                    "Stack cleared by {}.",
                    self.directory.mention(&invocation.sender)
                )])
            }
            StackCommand::Help => Ok(vec![HELP_TEXT.to_string()]),
        }
    }

    fn join_replies(&self, who: &Identity, outcome: &JoinOutcome) -> Vec<String> {
        let who = self.directory.mention(who);
        match outcome {
            JoinOutcome::First => vec![format!("{}, you have the floor.", who)],
            JoinOutcome::Inserted {
                predecessors,
                moved,
                new_front,
            } => {
                let behind = predecessors
                    .last()
                    .map(|p| self.directory.mention(p))
                    .unwrap_or_default();
                let mut replies = vec![if *moved {
                    format!("{} was already on the stack; moved behind {}.", who, behind)
                } else {
                    format!("{} is on the stack after {}.", who, behind)
                }];
                if let Some(front) = new_front {
                    replies.push(format!("{}, you have the floor.", self.directory.mention(front)));
                }
                replies
            }
        }
    }

    fn leave_reply(&self, who: &Identity, outcome: &LeaveOutcome) -> String {
        let who = self.directory.mention(who);
        match outcome {
            LeaveOutcome::BecameFront(next) => format!(
                "{} is off the stack. {}, you have the floor.",
                who,
                self.directory.mention(next)
            ),
            LeaveOutcome::NowEmpty => format!("{} is off the stack. The stack is now empty.", who),
            LeaveOutcome::NoFrontChange => format!("{} is off the stack.", who),
        }
    }

    fn peek_reply(&self, outcome: &PeekOutcome) -> String {
        match outcome {
            PeekOutcome::Empty => "The stack is empty!".to_string(),
            PeekOutcome::Members(members) => {
                let list = members
                    .iter()
                    .enumerate()
                    .map(|(idx, m)| format!("{}. {}", idx + 1, self.directory.mention(m)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("Current stack:\n{}", list)
            }
        }
    }
}
