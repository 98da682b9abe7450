use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use rtc_integration::{IceServer, RtcConfiguration, DEFAULT_STUN_SERVERS};
use serde::Deserialize;
use shared::protocol::methods;

use crate::{reconnect::ReconnectPolicy, transport::Platform};

pub const SETTINGS_FILE: &str = "client.toml";

pub const DEFAULT_ALTERNATE_HUB_PATHS: [&str; 5] =
    ["/chat", "/api/chat", "/api/chat/hub", "/chat/hub", "/hub"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub hub_base_url: String,
    pub hub_path: String,
    pub alternate_hub_paths: Vec<String>,
    pub platform: Platform,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_method: String,
    pub invoke_timeout_secs: u64,
    pub ice_servers: Vec<String>,
    pub gif_api_url: String,
    pub gif_api_key: Option<String>,
    pub token_store_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hub_base_url: "http://127.0.0.1:5000".into(),
            hub_path: "/chat".into(),
            alternate_hub_paths: DEFAULT_ALTERNATE_HUB_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
            platform: Platform::Native,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_secs: 30,
            heartbeat_method: methods::GET_CONNECTION_ID.into(),
            invoke_timeout_secs: 15,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| url.to_string()).collect(),
            gif_api_url: "https://api.giphy.com".into(),
            gif_api_key: None,
            token_store_path: PathBuf::from("./data/tokens.json"),
        }
    }
}

impl Settings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| IceServer::stun(url.clone()))
                .collect(),
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    settings_from_sources(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `client.toml` values, then environment overrides.
pub fn settings_from_sources(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
            apply_value(&mut settings, &file_cfg, "hub_url", |s, v| s.hub_base_url = v);
            apply_value(&mut settings, &file_cfg, "hub_path", |s, v| s.hub_path = v);
            apply_value(&mut settings, &file_cfg, "alternate_hub_paths", |s, v| {
                s.alternate_hub_paths = split_list(&v)
            });
            apply_value(&mut settings, &file_cfg, "platform", |s, v| {
                if let Some(platform) = Platform::parse(&v) {
                    s.platform = platform;
                }
            });
            apply_value(&mut settings, &file_cfg, "ice_servers", |s, v| {
                s.ice_servers = split_list(&v)
            });
            apply_value(&mut settings, &file_cfg, "gif_api_url", |s, v| s.gif_api_url = v);
            apply_value(&mut settings, &file_cfg, "token_store_path", |s, v| {
                s.token_store_path = PathBuf::from(v)
            });
        }
    }

    for key in ["HUB_URL", "APP__HUB_URL"] {
        if let Some(v) = env(key) {
            settings.hub_base_url = v;
        }
    }
    if let Some(v) = env("APP__HUB_PATH") {
        settings.hub_path = v;
    }
    if let Some(v) = env("APP__ALTERNATE_HUB_PATHS") {
        settings.alternate_hub_paths = split_list(&v);
    }
    if let Some(platform) = env("APP__PLATFORM").as_deref().and_then(Platform::parse) {
        settings.platform = platform;
    }
    if let Some(v) = env("APP__RECONNECT_BASE_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = env("APP__RECONNECT_CAP_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_cap_ms = v;
    }
    if let Some(v) = env("APP__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = env("APP__HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
        settings.heartbeat_interval_secs = v;
    }
    if let Some(v) = env("APP__HEARTBEAT_METHOD") {
        settings.heartbeat_method = v;
    }
    if let Some(v) = env("APP__INVOKE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.invoke_timeout_secs = v;
    }
    if let Some(v) = env("APP__ICE_SERVERS") {
        settings.ice_servers = split_list(&v);
    }
    if let Some(v) = env("APP__GIF_API_URL") {
        settings.gif_api_url = v;
    }
    for key in ["GIF_API_KEY", "APP__GIF_API_KEY"] {
        if let Some(v) = env(key).filter(|v| !v.trim().is_empty()) {
            settings.gif_api_key = Some(v);
        }
    }
    if let Some(v) = env("APP__TOKEN_STORE_PATH") {
        settings.token_store_path = PathBuf::from(v);
    }

    settings
}

fn apply_value(
    settings: &mut Settings,
    values: &HashMap<String, String>,
    key: &str,
    apply: impl FnOnce(&mut Settings, String),
) {
    if let Some(v) = values.get(key) {
        apply(settings, v.clone());
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reconnect_and_heartbeat_contract() {
        let settings = settings_from_sources(None, env_from(&[]));
        let policy = settings.reconnect_policy();
        assert_eq!(policy.base, Duration::from_millis(1_000));
        assert_eq!(policy.cap, Duration::from_millis(30_000));
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(settings.alternate_hub_paths.len(), 5);
        assert_eq!(settings.platform, Platform::Native);
        assert!(settings.gif_api_key.is_none());
    }

    #[test]
    fn env_overrides_file_values() {
        let file = r#"
            hub_url = "https://file.example"
            platform = "browser"
            alternate_hub_paths = "/a, /b"
        "#;
        let settings = settings_from_sources(
            Some(file),
            env_from(&[
                ("APP__HUB_URL", "https://env.example"),
                ("APP__MAX_RECONNECT_ATTEMPTS", "9"),
                ("APP__HEARTBEAT_SECS", "not-a-number"),
                ("GIF_API_KEY", "  "),
            ]),
        );
        assert_eq!(settings.hub_base_url, "https://env.example");
        assert_eq!(settings.platform, Platform::Browser);
        assert_eq!(settings.alternate_hub_paths, vec!["/a", "/b"]);
        assert_eq!(settings.max_reconnect_attempts, 9);
        assert_eq!(settings.heartbeat_interval_secs, 30);
        assert!(settings.gif_api_key.is_none());
    }
}
