use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::protocol::TargetDrive;
use tracing::warn;

pub const SETTINGS_FILE: &str = "chat_sync.toml";
const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub drive_alias: String,
    pub drive_type: String,
    pub inbox_batch_size: usize,
    pub safety_window_ms: i64,
    pub max_catch_up_age_ms: i64,
    pub first_page_size: usize,
    pub page_size: usize,
    pub conversation_page_size: usize,
    pub inline_content_limit: usize,
    pub preview_chars: usize,
    pub live_flush_interval_ms: u64,
    pub live_flush_threshold: usize,
    pub reconnect_delay_ms: u64,
    pub database_url: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            drive_alias: TargetDrive::CHAT_ALIAS.into(),
            drive_type: TargetDrive::CHAT_TYPE.into(),
            inbox_batch_size: 2000,
            safety_window_ms: 2 * 60 * 1000,
            max_catch_up_age_ms: 24 * 60 * 60 * 1000,
            first_page_size: 15,
            page_size: 100,
            conversation_page_size: 100,
            inline_content_limit: 7000,
            preview_chars: 140,
            live_flush_interval_ms: 700,
            live_flush_threshold: 25,
            reconnect_delay_ms: 2000,
            database_url: "sqlite://./data/chat_sync.db".into(),
        }
    }
}

impl SyncSettings {
    pub fn target_drive(&self) -> TargetDrive {
        TargetDrive::new(&self.drive_alias, &self.drive_type)
    }

    pub fn live_flush_interval(&self) -> Duration {
        Duration::from_millis(self.live_flush_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    fn apply_override(&mut self, field: &str, raw: &str) {
        let raw = raw.trim();
        let applied = match field {
            "drive_alias" => {
                self.drive_alias = raw.to_string();
                true
            }
            "drive_type" => {
                self.drive_type = raw.to_string();
                true
            }
            "database_url" => {
                self.database_url = normalize_database_url(raw);
                true
            }
            "inbox_batch_size" => parse_into(raw, &mut self.inbox_batch_size),
            "safety_window_ms" => parse_into(raw, &mut self.safety_window_ms),
            "max_catch_up_age_ms" => parse_into(raw, &mut self.max_catch_up_age_ms),
            "first_page_size" => parse_into(raw, &mut self.first_page_size),
            "page_size" => parse_into(raw, &mut self.page_size),
            "conversation_page_size" => parse_into(raw, &mut self.conversation_page_size),
            "inline_content_limit" => parse_into(raw, &mut self.inline_content_limit),
            "preview_chars" => parse_into(raw, &mut self.preview_chars),
            "live_flush_interval_ms" => parse_into(raw, &mut self.live_flush_interval_ms),
            "live_flush_threshold" => parse_into(raw, &mut self.live_flush_threshold),
            "reconnect_delay_ms" => parse_into(raw, &mut self.reconnect_delay_ms),
            _ => return,
        };
        if !applied {
            warn!(field, value = raw, "config: ignoring invalid override");
        }
    }
}

const FIELDS: &[&str] = &[
    "drive_alias",
    "drive_type",
    "inbox_batch_size",
    "safety_window_ms",
    "max_catch_up_age_ms",
    "first_page_size",
    "page_size",
    "conversation_page_size",
    "inline_content_limit",
    "preview_chars",
    "live_flush_interval_ms",
    "live_flush_threshold",
    "reconnect_delay_ms",
    "database_url",
];

fn parse_into<T: std::str::FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Reads the optional settings file, then applies `CHAT_SYNC__<FIELD>` overrides.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<SyncSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: settings file ignored: {err}");
                SyncSettings::default()
            }
        },
        Err(_) => SyncSettings::default(),
    };
    settings.database_url = normalize_database_url(&settings.database_url);

    for field in FIELDS {
        let key = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
        if let Some(value) = env(&key) {
            settings.apply_override(field, &value);
        }
    }

    settings
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
