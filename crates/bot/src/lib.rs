//! Demo Mate bot library.
//!
//! A ChatOps bot that lets a chat conversation stand up a Snowflake demo
//! environment, ask Cortex Analyst questions against it, and tear it down.
//!
//! # Security
//!
//! This crate holds privileged material:
//! - The bot's RSA private key and the bearer tokens minted from it
//! - A programmatic access token able to alter the bot user
//! - The Slack bot token and signing secret

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod analyst;
pub mod backend;
pub mod config;
pub mod credential;
pub mod error;
pub mod provision;
pub mod services;
pub mod session;
pub mod slack;
pub mod snowflake;
pub mod state;
