//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use tracing::warn;
use wearmaps_core::tile::DEFAULT_STATIC_MAP_URL;

/// Daemon configuration. File: ~/.config/wearmaps/config.toml or /etc/wearmaps/config.toml.
/// Env overrides: WEARMAPS_TRANSPORT_PORT, WEARMAPS_MAP_BASE_URL, WEARMAPS_MAP_API_KEY,
/// WEARMAPS_FETCH_TIMEOUT_SECS, WEARMAPS_LOCATION_FEED.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer channel TCP port (default 45680).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Name announced to the wearable in the handshake.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_map_base_url")]
    pub map_base_url: String,
    #[serde(default)]
    pub map_api_key: Option<String>,
    /// Upper bound on a single tile download (default 15).
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Send `failed` replies when a download fails.
    #[serde(default = "default_report_fetch_failures")]
    pub report_fetch_failures: bool,
    /// Fixed position used as the last known fix until the feed reports one.
    #[serde(default)]
    pub fixed_latitude: Option<f64>,
    #[serde(default)]
    pub fixed_longitude: Option<f64>,
    /// File or FIFO of "<lat> <lon>" lines.
    #[serde(default)]
    pub location_feed: Option<PathBuf>,
    /// Shell command run when the wearable asks for the phone UI.
    #[serde(default)]
    pub ui_command: Option<String>,
}

fn default_transport_port() -> u16 {
    45680
}
fn default_display_name() -> String {
    "wearmaps-linux".to_string()
}
fn default_map_base_url() -> String {
    DEFAULT_STATIC_MAP_URL.to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    15
}
fn default_report_fetch_failures() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_port: default_transport_port(),
            display_name: default_display_name(),
            map_base_url: default_map_base_url(),
            map_api_key: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            report_fetch_failures: default_report_fetch_failures(),
            fixed_latitude: None,
            fixed_longitude: None,
            location_feed: None,
            ui_command: None,
        }
    }
}

impl Config {
    /// Fixed position, if both halves are set.
    pub fn fixed_position(&self) -> Option<(f64, f64)> {
        match (self.fixed_latitude, self.fixed_longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("WEARMAPS_TRANSPORT_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.transport_port = p;
            }
        }
        if let Some(s) = var("WEARMAPS_MAP_BASE_URL") {
            self.map_base_url = s;
        }
        if let Some(s) = var("WEARMAPS_MAP_API_KEY") {
            self.map_api_key = Some(s);
        }
        if let Some(s) = var("WEARMAPS_FETCH_TIMEOUT_SECS") {
            if let Ok(t) = s.parse::<u64>() {
                self.fetch_timeout_secs = t.max(1);
            }
        }
        if let Some(s) = var("WEARMAPS_LOCATION_FEED") {
            self.location_feed = Some(PathBuf::from(s));
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wearmaps/config.toml"));
    }
    out.push(PathBuf::from("/etc/wearmaps/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "ignoring config file"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.fetch_timeout_secs, 15);
        assert!(c.report_fetch_failures);
    }

    #[test]
    fn file_values_parse() {
        let c: Config = toml::from_str(
            r#"
            transport_port = 5000
            map_api_key = "secret"
            fixed_latitude = 37.422
            fixed_longitude = -122.084
            location_feed = "/run/wearmaps/fix"
            "#,
        )
        .unwrap();
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.map_api_key.as_deref(), Some("secret"));
        assert_eq!(c.fixed_position(), Some((37.422, -122.084)));
        assert_eq!(c.location_feed, Some(PathBuf::from("/run/wearmaps/fix")));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn half_a_position_is_no_position() {
        let c = Config {
            fixed_latitude: Some(1.0),
            ..Config::default()
        };
        assert_eq!(c.fixed_position(), None);
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("WEARMAPS_TRANSPORT_PORT", "6000"),
            ("WEARMAPS_FETCH_TIMEOUT_SECS", "0"),
            ("WEARMAPS_MAP_BASE_URL", "http://127.0.0.1:9/staticmap"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.transport_port, 6000);
        assert_eq!(c.fetch_timeout_secs, 1);
        assert_eq!(c.map_base_url, "http://127.0.0.1:9/staticmap");
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        c.apply_env(|k| (k == "WEARMAPS_TRANSPORT_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(c.transport_port, 45680);
    }
}
