//! Demo Mate Core - Shared types library.
//!
//! This crate provides common types used across all Demo Mate components:
//! - `bot` - Credential, provisioning, query and session orchestration
//! - `cli` - Operator binary driving the bot for one conversation
//! - `integration-tests` - In-memory backends and scenario tests
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no HTTP clients, no key
//! material. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Conversation keys, resource-set identifiers, commands and statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
