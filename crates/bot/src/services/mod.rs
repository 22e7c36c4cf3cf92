//! Business logic services.
//!
//! # Services
//!
//! - `chatops` - Runs chat commands through the session router and posts replies

pub mod chatops;

pub use chatops::{ChatOpsService, HandledCommand};
