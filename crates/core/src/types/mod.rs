//! Core types for Demo Mate.
//!
//! This module provides type-safe wrappers for the domain concepts shared
//! between the bot library, the CLI and the tests.

pub mod command;
pub mod id;
pub mod identifier;
pub mod status;

pub use command::{Command, CommandError, CommandKind};
pub use id::{ConversationKey, CorrelationId, Principal};
pub use identifier::{IdentifierError, ResourceSetId, SqlIdentifier};
pub use status::*;
