//! Common types and utilities shared between the CLI and the daemon.

pub mod config;
pub mod logging;
pub mod paths;
pub mod process;
pub mod tmux;
