//! Configuration for the liveupdates watcher.
//!
//! Settings persist to disk as RON files, every section tolerates missing
//! and unknown fields, and CLI flags parsed with clap override the file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, EventApiSettings, WatchConfig};
pub use error::ConfigError;
