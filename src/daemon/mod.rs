//! Background daemon that watches a tmux session and plays notifications.

pub mod matcher;
pub mod monitor;
pub mod notifier;
pub mod supervisor;
