// ABOUTME: Library root for TimescaleDB-aware backup and restore
// ABOUTME: Exposes the dump and restore orchestrators and their building blocks

pub mod cli;
pub mod command;
pub mod config;
pub mod dump;
pub mod error;
pub mod extension;
pub mod info;
pub mod jobs;
pub mod postgres;
pub mod restore;
pub mod tools;

pub use config::Config;
pub use dump::dump;
pub use error::{BackupError, CommandError};
pub use restore::restore;
