//! claw-ruler - rule evaluation daemon.
//!
//! Loads rule files, evaluates them on their group intervals through
//! [`claw_rules::Manager`] and reloads them on SIGHUP. The `replay`
//! subcommand backfills rule results over a historical range instead.

#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
