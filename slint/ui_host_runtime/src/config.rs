use crate::protocol::{CLIENT_TO_SERVER_CAP, SERVER_TO_CLIENT_CAP};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_DEBOUNCE_MS: u64 = 60;
const DEFAULT_WAIT_HINT_MS: u64 = 500;
const DEFAULT_DOUBLE_CLICK_MS: u64 = 500;
const DEFAULT_DOUBLE_CLICK_RADIUS: i32 = 5;

/// Host platform, used only to normalize modifier keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Command is reported as ctrl.
    Mac,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub url: String,
    pub debounce_ms: u64,
    pub wait_hint_ms: u64,
    pub double_click_ms: u64,
    pub double_click_radius: i32,
    pub platform: Platform,
    pub display_id: String,
    pub max_inbound_frame: usize,
    pub max_outbound_frame: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "mirror".to_string(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            wait_hint_ms: DEFAULT_WAIT_HINT_MS,
            double_click_ms: DEFAULT_DOUBLE_CLICK_MS,
            double_click_radius: DEFAULT_DOUBLE_CLICK_RADIUS,
            platform: Platform::Other,
            display_id: "w1".to_string(),
            max_inbound_frame: SERVER_TO_CLIENT_CAP,
            max_outbound_frame: CLIENT_TO_SERVER_CAP,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unset, unparsable
    /// and non-positive values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("MIRROR_UI_URL").filter(|raw| !raw.trim().is_empty()) {
            config.url = url;
        }
        if let Some(value) = parse_positive(&lookup, "MIRROR_UI_DEBOUNCE_MS") {
            config.debounce_ms = value;
        }
        if let Some(value) = parse_positive(&lookup, "MIRROR_UI_WAIT_HINT_MS") {
            config.wait_hint_ms = value;
        }
        if let Some(value) = parse_positive(&lookup, "MIRROR_UI_DOUBLE_CLICK_MS") {
            config.double_click_ms = value;
        }
        if let Some(value) = parse_positive::<i32>(&lookup, "MIRROR_UI_DOUBLE_CLICK_RADIUS") {
            config.double_click_radius = value;
        }
        if let Some(platform) = lookup("MIRROR_UI_PLATFORM") {
            config.platform = match platform.trim().to_ascii_lowercase().as_str() {
                "mac" | "macos" => Platform::Mac,
                _ => Platform::Other,
            };
        }

        config
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn wait_hint(&self) -> Duration {
        Duration::from_millis(self.wait_hint_ms)
    }

    pub fn double_click_window(&self) -> Duration {
        Duration::from_millis(self.double_click_ms)
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
