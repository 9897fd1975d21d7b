use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

const DEFAULT_SETTINGS_FILE: &str = "presence.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSettings {
    pub server_url: Option<String>,
    pub debounce_ms: u64,
    pub release_grace_ms: u64,
    pub max_backoff_ms: u64,
    pub reconnect_delay_ms: u64,
    pub event_capacity: usize,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            debounce_ms: 500,
            release_grace_ms: 5_000,
            max_backoff_ms: 60_000,
            reconnect_delay_ms: 2_000,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    debounce_ms: Option<u64>,
    release_grace_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl PresenceSettings {
    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms)
    }

    pub fn release_grace(&self) -> Duration {
        millis(self.release_grace_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        millis(self.max_backoff_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        millis(self.reconnect_delay_ms)
    }

    fn apply_file(&mut self, raw: &str) -> Result<(), toml::de::Error> {
        let file_cfg = toml::from_str::<FileSettings>(raw)?;
        if let Some(v) = file_cfg.server_url {
            self.server_url = Some(v);
        }
        if let Some(v) = file_cfg.debounce_ms {
            self.debounce_ms = v;
        }
        if let Some(v) = file_cfg.release_grace_ms {
            self.release_grace_ms = v;
        }
        if let Some(v) = file_cfg.max_backoff_ms {
            self.max_backoff_ms = v;
        }
        if let Some(v) = file_cfg.reconnect_delay_ms {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = file_cfg.event_capacity {
            self.event_capacity = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PRESENCE_SERVER_URL") {
            self.server_url = Some(v);
        }
        if let Some(v) = parse_env(&lookup, "PRESENCE__DEBOUNCE_MS") {
            self.debounce_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "PRESENCE__RELEASE_GRACE_MS") {
            self.release_grace_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "PRESENCE__MAX_BACKOFF_MS") {
            self.max_backoff_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "PRESENCE__RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = v;
        }
    }
}

pub fn load_settings() -> PresenceSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

/// Defaults, overridden by `path` when it exists, overridden by the environment.
pub fn load_settings_from(path: &Path) -> PresenceSettings {
    let mut settings = PresenceSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(error) = settings.apply_file(&raw) {
            warn!(path = %path.display(), %error, "presence: ignoring malformed settings file");
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

fn parse_env(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "presence: ignoring non-numeric setting override");
            None
        }
    }
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value.max(1))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
