//! Follow 7TV emote set, user and cosmetic updates from the terminal.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p liveupdates-watch -- --emote-set <id>` to follow one set.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use liveupdates_config::{CliArgs, Config};
use liveupdates_eventapi::json::JsonExt;
use liveupdates_eventapi::{
    CosmeticCreateDispatch, EmoteAddDispatch, EmoteRemoveDispatch, EmoteUpdateDispatch,
    EntitlementCreateDeleteDispatch, EventApi, UserConnectionUpdateDispatch, WsConnector,
};
use tracing::{error, info, warn};

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(60);

fn connect_listeners(api: &EventApi) {
    let signals = api.signals();
    signals.emote_added.connect(|e: &EmoteAddDispatch| {
        let name = e.emote_json.str_or_empty("name");
        info!(set = %e.emote_set_id, actor = %e.actor_name, emote = %e.emote_id, "Emote {name} added");
    });
    signals.emote_updated.connect(|e: &EmoteUpdateDispatch| {
        info!(
            set = %e.emote_set_id,
            actor = %e.actor_name,
            emote = %e.emote_id,
            "Emote {} renamed to {}", e.old_emote_name, e.emote_name
        );
    });
    signals.emote_removed.connect(|e: &EmoteRemoveDispatch| {
        info!(set = %e.emote_set_id, actor = %e.actor_name, emote = %e.emote_id, "Emote {} removed", e.emote_name);
    });
    signals.user_updated.connect(|e: &UserConnectionUpdateDispatch| {
        info!(
            user = %e.user_id,
            actor = %e.actor_name,
            connection = e.connection_index,
            "Active emote set changed from {} to {}", e.old_emote_set_id, e.emote_set_id
        );
    });
    signals.cosmetic_created.connect(|e: &CosmeticCreateDispatch| {
        info!(kind = ?e.kind, "Cosmetic created");
    });
    signals.entitlement_created.connect(|e: &EntitlementCreateDeleteDispatch| {
        info!(user = %e.user_name, kind = ?e.kind, cosmetic = %e.ref_id, "Entitlement granted");
    });
    signals.entitlement_deleted.connect(|e: &EntitlementCreateDeleteDispatch| {
        info!(user = %e.user_name, kind = ?e.kind, cosmetic = %e.ref_id, "Entitlement revoked");
    });
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    liveupdates_eventapi::transport::ws::validate_url(&config.eventapi.host)?;

    let api = EventApi::new(
        settings::event_api_config(&config.eventapi),
        Arc::new(WsConnector::new()),
    );
    connect_listeners(&api);
    let event_loop = api
        .start()
        .ok_or("event loop could not be started")?;

    settings::subscribe_watched(&api, &config);
    info!(host = %config.eventapi.host, "Watching for updates, press Ctrl-C to stop");

    let mut report = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = report.tick() => {
                let diag = api.diagnostics();
                info!(
                    connections = api.connection_count(),
                    subscriptions = api.subscription_count(),
                    backlog = api.backlog_len(),
                    opened = diag.connections_opened,
                    closed = diag.connections_closed,
                    failed = diag.connections_failed,
                    delivered = diag.dispatches_delivered,
                    dropped = diag.dispatches_dropped,
                    "Diagnostics"
                );
            }
        }
    }

    info!("Shutting down");
    api.stop();
    event_loop.await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    liveupdates_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if config.watch.is_empty() {
        warn!("Nothing to watch, pass --user, --emote-set or --channel");
    }

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}
