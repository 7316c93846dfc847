use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::ApiKeyPolicy;
use tracing::warn;

use crate::session::{SessionPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY};

pub const DEFAULT_CONFIG_FILE: &str = "researcher.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub page_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub api_key_policy: ApiKeyPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_url: "http://localhost:8000/".into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            connect_timeout_ms: 10_000,
            api_key_policy: ApiKeyPolicy::Warn,
        }
    }
}

impl Settings {
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            page_url: self.page_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            api_key_policy: self.api_key_policy,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    page_url: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    api_key_policy: Option<ApiKeyPolicy>,
}

/// Defaults, then the config file, then environment variables.
pub fn load_settings(config_path: &Path) -> Settings {
    load_settings_with(config_path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(config_path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(
                path = %config_path.display(),
                %err,
                "ignoring unreadable config file"
            ),
        }
    }

    if let Some(v) = env("RESEARCHER_PAGE_URL") {
        settings.page_url = v;
    }
    if let Some(v) = env("APP__PAGE_URL") {
        settings.page_url = v;
    }

    if let Some(v) = env("APP__MAX_RECONNECT_ATTEMPTS") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.max_reconnect_attempts = parsed,
            Err(err) => warn!(value = %v, %err, "ignoring APP__MAX_RECONNECT_ATTEMPTS"),
        }
    }

    if let Some(v) = env("APP__RECONNECT_DELAY_MS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.reconnect_delay_ms = parsed,
            Err(err) => warn!(value = %v, %err, "ignoring APP__RECONNECT_DELAY_MS"),
        }
    }

    if let Some(v) = env("APP__CONNECT_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.connect_timeout_ms = parsed,
            Err(err) => warn!(value = %v, %err, "ignoring APP__CONNECT_TIMEOUT_MS"),
        }
    }

    if let Some(v) = env("APP__API_KEY_POLICY") {
        match v.parse::<ApiKeyPolicy>() {
            Ok(parsed) => settings.api_key_policy = parsed,
            Err(err) => warn!(%err, "ignoring APP__API_KEY_POLICY"),
        }
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.page_url {
        settings.page_url = v;
    }
    if let Some(v) = file_cfg.max_reconnect_attempts {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file_cfg.connect_timeout_ms {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = file_cfg.api_key_policy {
        settings.api_key_policy = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
