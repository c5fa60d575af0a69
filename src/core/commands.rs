//! Stack command grammar.
//!
//! Accepted forms:
//! - `stack`, `stack on <anything>`, `stack @name` (join)
//! - `unstack`, `stack drop`, `stack done`, each with optional `@name` (leave)
//! - `restack` with optional `@name` (requeue)
//! - `stack show|list`, `stacks show|list` (peek)
//! - `stack clear`, `stacks clear` (clear)
//! - `stack help`, `stacks help`
//!
//! A leading `/` and a `@botname` suffix on the first word are ignored, so
//! Telegram-style `/stack@my_bot show` works too.

use regex::Regex;
use std::sync::OnceLock;

/// A parsed stack command. Names are given without the leading `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCommand {
    Join(Option<String>),
    Leave(Option<String>),
    Requeue(Option<String>),
    Peek,
    Clear,
    Help,
}

impl StackCommand {
    /// The verb used when telling a user the command could not be carried out.
    pub fn action(&self) -> &'static str {
        match self {
            StackCommand::Join(_) => "add to the stack",
            StackCommand::Leave(_) => "remove from the stack",
            StackCommand::Requeue(_) => "restack",
            StackCommand::Peek => "show the stack",
            StackCommand::Clear => "clear the stack",
            StackCommand::Help => "help",
        }
    }

    /// Explicit subject name, if the command carries one.
    pub fn subject(&self) -> Option<&str> {
        match self {
            StackCommand::Join(name) | StackCommand::Leave(name) | StackCommand::Requeue(name) => {
                name.as_deref()
            }
            _ => None,
        }
    }
}

struct Grammar {
    join: Regex,
    leave: Regex,
    requeue: Regex,
    peek: Regex,
    clear: Regex,
    help: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        join: Regex::new(r"^stack(?:\s+(?:on.*|@(\w+)\s*))?$").expect("join pattern"),
        leave: Regex::new(r"^(?:unstack|stack (?:drop|done))(?:\s+@(\w+)\s*)?$").expect("leave pattern"),
        requeue: Regex::new(r"^restack(?:\s+@(\w+)\s*)?$").expect("requeue pattern"),
        peek: Regex::new(r"^stacks? (?:show|list)\b").expect("peek pattern"),
        clear: Regex::new(r"^stacks? clear\b").expect("clear pattern"),
        help: Regex::new(r"^stacks? help\s*$").expect("help pattern"),
    })
}

/// Turn a Telegram `/command@botname` into the plain command word.
fn normalize(text: &str) -> String {
    let text = text.trim();
    let Some(text) = text.strip_prefix('/') else {
        return text.to_string();
    };

    let (first, rest) = match text.find(char::is_whitespace) {
        Some(idx) => text.split_at(idx),
        None => (text, ""),
    };
    let first = match first.split_once('@') {
        Some((head, _bot)) if !head.is_empty() => head,
        _ => first,
    };
    format!("{}{}", first, rest)
}

fn subject(caps: &regex::Captures<'_>) -> Option<String> {
    caps.get(1).map(|m| m.as_str().to_string())
}

/// Parse a chat message into a stack command.
pub fn parse_command(text: &str) -> Option<StackCommand> {
    let text = normalize(text);
    let g = grammar();

    if let Some(caps) = g.join.captures(&text) {
        return Some(StackCommand::Join(subject(&caps)));
    }
    if let Some(caps) = g.leave.captures(&text) {
        return Some(StackCommand::Leave(subject(&caps)));
    }
    if let Some(caps) = g.requeue.captures(&text) {
        return Some(StackCommand::Requeue(subject(&caps)));
    }
    if g.peek.is_match(&text) {
        return Some(StackCommand::Peek);
    }
    if g.clear.is_match(&text) {
        return Some(StackCommand::Clear);
    }
    if g.help.is_match(&text) {
        return Some(StackCommand::Help);
    }
    None
}

pub const HELP_TEXT: &str = r#"Stack commands:

stack - Add yourself to the stack
stack on <topic> - Add yourself to the stack
stack @name - Add someone else
unstack | stack done | stack drop [@name] - Leave the stack
restack [@name] - Move to the back of the stack
stack show | stack list - Show the stack
stack clear - Empty the stack"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Option<String> {
        Some(name.to_string())
    }

    #[test]
    fn test_join_forms() {
        assert_eq!(parse_command("stack"), Some(StackCommand::Join(None)));
        assert_eq!(parse_command("stack @user"), Some(StackCommand::Join(named("user"))));
        assert_eq!(parse_command("stack on that"), Some(StackCommand::Join(None)));
        assert_eq!(parse_command("stack some boxes"), None);
    }

    #[test]
    fn test_leave_forms() {
        assert_eq!(parse_command("unstack"), Some(StackCommand::Leave(None)));
        assert_eq!(parse_command("unstack @user"), Some(StackCommand::Leave(named("user"))));
        assert_eq!(parse_command("stack drop"), Some(StackCommand::Leave(None)));
        assert_eq!(parse_command("stack done @Ford"), Some(StackCommand::Leave(named("Ford"))));
    }

    #[test]
    fn test_requeue_forms() {
        assert_eq!(parse_command("restack"), Some(StackCommand::Requeue(None)));
        assert_eq!(parse_command("restack @user"), Some(StackCommand::Requeue(named("user"))));
        assert_eq!(parse_command("restack now"), None);
    }

    #[test]
    fn test_peek_clear_help() {
        for text in ["stack show", "stacks show", "stack list", "stacks list"] {
            assert_eq!(parse_command(text), Some(StackCommand::Peek), "{}", text);
        }
        assert_eq!(parse_command("stack clear"), Some(StackCommand::Clear));
        assert_eq!(parse_command("stacks clear"), Some(StackCommand::Clear));
        assert_eq!(parse_command("stack help"), Some(StackCommand::Help));
        assert_eq!(parse_command("stack showing"), None);
    }

    #[test]
    fn test_telegram_style() {
        assert_eq!(parse_command("/stack"), Some(StackCommand::Join(None)));
        assert_eq!(parse_command("/stack@stacker_bot show"), Some(StackCommand::Peek));
        assert_eq!(parse_command("  /unstack@stacker_bot @zaphod "), Some(StackCommand::Leave(named("zaphod"))));
        assert_eq!(parse_command("hello there"), None);
    }

    #[test]
    fn test_bot_suffix_needs_slash() {
        assert_eq!(parse_command("stack@zaphod"), None);
        assert_eq!(parse_command("unstack@zaphod"), None);
        assert_eq!(parse_command("/restack@stacker_bot"), Some(StackCommand::Requeue(None)));
    }

    #[test]
    fn test_unicode_names() {
        assert_eq!(parse_command("stack @Zoë"), Some(StackCommand::Join(named("Zoë"))));
    }
}
