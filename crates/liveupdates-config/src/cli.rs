//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments of the `liveupdates` watcher.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "liveupdates", about = "Follow 7TV emote and cosmetic updates")]
pub struct CliArgs {
    /// EventAPI WebSocket URL.
    #[arg(long)]
    pub host: Option<String>,

    /// 7TV user id to follow.
    #[arg(long)]
    pub user: Option<String>,

    /// 7TV emote set id to follow.
    #[arg(long)]
    pub emote_set: Option<String>,

    /// Twitch user id whose channel to follow. Repeatable.
    #[arg(long = "channel")]
    pub channels: Vec<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.eventapi.host = host.clone();
        }
        if let Some(ref user) = args.user {
            self.watch.user_id = user.clone();
        }
        if let Some(ref set) = args.emote_set {
            self.watch.emote_set_id = set.clone();
        }
        if !args.channels.is_empty() {
            self.watch.twitch_channels = args.channels.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
