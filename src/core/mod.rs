//! Core module - command grammar and dispatch.
//!
//! This module sits between the chat transport and the stack rules:
//! - Stack command parsing
//! - Dispatch to the queue service and reply formatting

pub mod commands;
pub mod dispatch;

pub use commands::{parse_command, StackCommand};
pub use dispatch::{Dispatcher, Invocation};
