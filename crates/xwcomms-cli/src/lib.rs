//! xwcomms CLI library
//!
//! Argument parsing, layered configuration and the loopback demo that
//! drive the comms engine from a terminal.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands, TransportArg};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use error::{CliError, Result};
