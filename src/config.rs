//! Process configuration from the environment.

use std::time::Duration;

use crate::{encoder::EncoderConfig, telemetry::ws::DEFAULT_TELEMETRY_URL};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const HEALTH_INTERVAL: Duration = Duration::from_millis(2000);
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend_url: String,
    pub telemetry_url: String,
    pub api_url: String,
    pub debug: bool,
    pub encoder: EncoderConfig,
    pub health_interval: Duration,
    pub health_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn telemetry_url_for(backend: &str) -> String {
    if let Some(rest) = backend.strip_prefix("https://") {
        format!("wss://{rest}/ws/video")
    } else if let Some(rest) = backend.strip_prefix("http://") {
        format!("ws://{rest}/ws/video")
    } else {
        DEFAULT_TELEMETRY_URL.to_string()
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let backend_url = get("PULSECAM_BACKEND_URL")
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let telemetry_url =
            get("PULSECAM_TELEMETRY_URL").unwrap_or_else(|| telemetry_url_for(&backend_url));
        let api_url = get("PULSECAM_API_URL")
            .unwrap_or_else(|| format!("{backend_url}/api"))
            .trim_end_matches('/')
            .to_string();
        let debug = get("PULSECAM_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            backend_url,
            telemetry_url,
            api_url,
            debug,
            encoder: EncoderConfig::default(),
            health_interval: HEALTH_INTERVAL,
            health_timeout: HEALTH_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_point_at_localhost() {
        let config = AppConfig::default();
        assert_eq!(config.backend_url, "http://localhost:8000");
        assert_eq!(config.telemetry_url, "ws://localhost:8000/ws/video");
        assert_eq!(config.api_url, "http://localhost:8000/api");
        assert!(!config.debug);
        assert_eq!(config.health_interval, Duration::from_millis(2000));
        assert_eq!(config.health_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn urls_follow_the_backend() {
        let config = config(&[("PULSECAM_BACKEND_URL", "https://vitals.example.org/")]);
        assert_eq!(config.backend_url, "https://vitals.example.org");
        assert_eq!(config.telemetry_url, "wss://vitals.example.org/ws/video");
        assert_eq!(config.api_url, "https://vitals.example.org/api");
    }

    #[test]
    fn explicit_values_win() {
        let config = config(&[
            ("PULSECAM_TELEMETRY_URL", "ws://10.0.0.2:9000/ws/video"),
            ("PULSECAM_API_URL", "http://10.0.0.2:9000/v2/"),
            ("PULSECAM_DEBUG", "TRUE"),
        ]);
        assert_eq!(config.telemetry_url, "ws://10.0.0.2:9000/ws/video");
        assert_eq!(config.api_url, "http://10.0.0.2:9000/v2");
        assert!(config.debug);
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config(&[("PULSECAM_BACKEND_URL", "  "), ("PULSECAM_DEBUG", "")]);
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert!(!config.debug);
    }
}
