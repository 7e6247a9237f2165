//! Command line tool for the node mesh.
//!
//! Provides commands for:
//! - Generating and inspecting node ids
//! - Bootstrapping a persistent identity
//! - Simulating a small mesh of nodes in process

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
