//! Mapping from the on-disk config to event API settings.

use std::time::Duration;

use liveupdates_config::{Config, EventApiSettings};
use liveupdates_eventapi::{BackoffConfig, EventApi, EventApiConfig};

pub fn event_api_config(settings: &EventApiSettings) -> EventApiConfig {
    EventApiConfig {
        host: settings.host.clone(),
        heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
        max_listens: settings.max_listens.max(1),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(settings.backoff_initial_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms.max(settings.backoff_initial_ms)),
            max_attempts: (settings.backoff_max_attempts > 0).then_some(settings.backoff_max_attempts),
            jitter: settings.backoff_jitter.clamp(0.0, 1.0),
            ..BackoffConfig::default()
        },
    }
}

/// Subscribe to everything listed in the `watch` section.
pub fn subscribe_watched(api: &EventApi, config: &Config) {
    let watch = &config.watch;
    api.subscribe_user(&watch.user_id, &watch.emote_set_id);
    for channel in &watch.twitch_channels {
        api.subscribe_twitch_channel(channel);
    }
}
