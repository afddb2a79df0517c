use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::app::AppError;
use crate::domain::models::Device;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub devices_file: String,
    pub poll_interval_secs: u64,
    pub debounce_samples: usize,
    pub probe_timeout_secs: u64,
    pub ping_count: u32,
    pub db_path: String,
    pub http_bind: String,
    pub history_days: i64,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    monitored_devices: Vec<Device>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            devices_file: string_or_default(&lookup, "DEVICES_FILE", "/etc/power-monitor/devices.json"),
            poll_interval_secs: parse_positive(&lookup, "POLL_INTERVAL_SECS", 30_u64)?,
            debounce_samples: parse_positive(&lookup, "DEBOUNCE_SAMPLES", 2_usize)?,
            probe_timeout_secs: parse_positive(&lookup, "PROBE_TIMEOUT_SECS", 5_u64)?,
            ping_count: parse_positive(&lookup, "PING_COUNT", 3_u32)?,
            db_path: string_or_default(&lookup, "DB_PATH", "/var/lib/power_monitor/power_cuts.db"),
            http_bind: string_or_default(&lookup, "HTTP_BIND", "127.0.0.1:8080"),
            history_days: parse_positive(&lookup, "HISTORY_DAYS", 30_i64)?,
        };

        // Echoes go out one second apart; a shorter timeout kills healthy runs.
        if config.probe_timeout_secs < u64::from(config.ping_count) {
            return Err(AppError::config(format!(
                "PROBE_TIMEOUT_SECS ({}) must be at least PING_COUNT ({})",
                config.probe_timeout_secs, config.ping_count
            )));
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn load_devices(&self) -> Result<Vec<Device>, AppError> {
        let content = std::fs::read_to_string(&self.devices_file).map_err(|error| {
            AppError::config(format!(
                "failed to read devices file {}: {error}",
                self.devices_file
            ))
        })?;
        parse_devices(&content)
    }
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = required(&lookup, "TELEGRAM_BOT_TOKEN")?;
        let chat_id = required(&lookup, "TELEGRAM_CHAT_ID")?;

        Ok(Self {
            bot_token,
            chat_id,
            api_url: string_or_default(&lookup, "TELEGRAM_API_URL", "https://api.telegram.org")
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// The chat the bot answers in. Telegram delivers updates with numeric
    /// chat ids only, so an `@channel` destination can receive notifications
    /// but never issue commands.
    pub fn command_chat_id(&self) -> Option<i64> {
        self.chat_id.parse().ok()
    }
}

pub fn parse_devices(content: &str) -> Result<Vec<Device>, AppError> {
    let file: DevicesFile = serde_json::from_str(content)
        .map_err(|error| AppError::config(format!("devices file is not valid JSON: {error}")))?;

    if file.monitored_devices.is_empty() {
        return Err(AppError::config("at least one monitored device is required"));
    }

    let mut addresses = HashSet::new();
    let mut devices = Vec::with_capacity(file.monitored_devices.len());
    for mut device in file.monitored_devices {
        device.name = device.name.trim().to_string();
        device.address = device.address.trim().to_string();

        if device.address.is_empty() || device.address.starts_with('-') {
            return Err(AppError::config(format!(
                "device '{}' has an invalid address",
                device.name
            )));
        }
        if !addresses.insert(device.address.clone()) {
            return Err(AppError::config(format!(
                "device address {} is configured more than once",
                device.address
            )));
        }
        if device.name.is_empty() {
            device.name = device.address.clone();
        }
        devices.push(device);
    }

    Ok(devices)
}

fn required<F>(lookup: &F, key: &str) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::config(format!("{key} is required")))
}

fn string_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_positive<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .ok()
            .filter(|value| *value > T::default())
            .ok_or_else(|| AppError::config(format!("{key} must be a positive number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, TelegramConfig, parse_devices};

    #[test]
    fn applies_defaults_for_optional_fields() {
        let config = AppConfig::from_lookup(|_| None).expect("config should be valid");

        assert_eq!(config.devices_file, "/etc/power-monitor/devices.json");
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.debounce_samples, 2);
        assert_eq!(config.probe_timeout_secs, 5);
        assert_eq!(config.ping_count, 3);
        assert_eq!(config.db_path, "/var/lib/power_monitor/power_cuts.db");
        assert_eq!(config.http_bind, "127.0.0.1:8080");
        assert_eq!(config.history_days, 30);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "POLL_INTERVAL_SECS" => Some("abc".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: POLL_INTERVAL_SECS must be a positive number"
        );
    }

    #[test]
    fn rejects_zero_debounce() {
        let result = AppConfig::from_lookup(|key| match key {
            "DEBOUNCE_SAMPLES" => Some("0".to_string()),
            _ => None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn rejects_probe_timeout_shorter_than_ping_run() {
        let result = AppConfig::from_lookup(|key| match key {
            "PROBE_TIMEOUT_SECS" => Some("2".to_string()),
            "PING_COUNT" => Some("3".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: PROBE_TIMEOUT_SECS (2) must be at least PING_COUNT (3)"
        );

        let config = AppConfig::from_lookup(|key| match key {
            "PROBE_TIMEOUT_SECS" => Some("3".to_string()),
            "PING_COUNT" => Some("3".to_string()),
            _ => None,
        })
        .expect("equal timeout and count should be valid");
        assert_eq!(config.probe_timeout_secs, 3);
    }

    #[test]
    fn rejects_missing_telegram_credentials() {
        let result = TelegramConfig::from_lookup(|key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: TELEGRAM_CHAT_ID is required"
        );
    }

    #[test]
    fn trims_trailing_slash_from_api_url() {
        let config = TelegramConfig::from_lookup(|key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".to_string()),
            "TELEGRAM_CHAT_ID" => Some("-100200".to_string()),
            "TELEGRAM_API_URL" => Some("http://127.0.0.1:9000/".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(config.api_url, "http://127.0.0.1:9000");
        assert_eq!(config.chat_id, "-100200");
        assert_eq!(config.command_chat_id(), Some(-100200));
    }

    #[test]
    fn channel_name_cannot_issue_commands() {
        let config = TelegramConfig::from_lookup(|key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".to_string()),
            "TELEGRAM_CHAT_ID" => Some("@power_alerts".to_string()),
            _ => None,
        })
        .expect("channel names are valid destinations");

        assert_eq!(config.chat_id, "@power_alerts");
        assert_eq!(config.command_chat_id(), None);
    }

    #[test]
    fn parses_devices_file() {
        let devices = parse_devices(
            r#"{"monitored_devices": [
                {"name": "WiproPlug", "ip": "10.10.10.61"},
                {"name": "Router", "address": "10.10.10.1", "description": "upstairs"}
            ]}"#,
        )
        .expect("devices should parse");

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "10.10.10.61");
        assert_eq!(devices[1].description, "upstairs");
    }

    #[test]
    fn rejects_empty_device_list() {
        let result = parse_devices(r#"{"monitored_devices": []}"#);

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: at least one monitored device is required"
        );
        assert!(parse_devices("{}").is_err());
    }

    #[test]
    fn rejects_duplicate_and_option_like_addresses() {
        let duplicate = parse_devices(
            r#"{"monitored_devices": [
                {"name": "a", "ip": "10.0.0.1"},
                {"name": "b", "ip": "10.0.0.1"}
            ]}"#,
        );
        assert!(duplicate.is_err());

        let option_like = parse_devices(r#"{"monitored_devices": [{"name": "x", "ip": "-f"}]}"#);
        assert!(option_like.is_err());
    }
}
