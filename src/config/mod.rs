//! Configuration management

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::hub::HubConfig;

/// Application directory name under the platform config/data roots
const APP_DIR_NAME: &str = "plex-nowplaying";

/// Environment prefix: `NOWPLAYING_PORT`, `NOWPLAYING_PLEX__TOKEN`, ...
const ENV_PREFIX: &str = "NOWPLAYING";

/// Legacy variables from the original deployment scripts, applied when the
/// prefixed variable is not set: (config key, prefixed var, legacy var)
const LEGACY_STRING_VARS: &[(&str, &str, &str)] = &[
    ("plex.server_url", "NOWPLAYING_PLEX__SERVER_URL", "PLEX_SERVER_URL"),
    ("plex.token", "NOWPLAYING_PLEX__TOKEN", "PLEX_TOKEN"),
    ("plex.username", "NOWPLAYING_PLEX__USERNAME", "PLEX_USERNAME"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub plex: PlexConfig,

    #[serde(default)]
    pub hub: HubSettings,
}

fn default_port() -> u16 {
    3001
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlexConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub token: String,
    /// Only webhooks from this Plex account are applied
    #[serde(default)]
    pub username: String,
    /// Allow self-signed certificates on an https server_url
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for PlexConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            server_port: default_server_port(),
            token: String::new(),
            username: String::new(),
            accept_invalid_certs: false,
        }
    }
}

fn default_server_url() -> String {
    "192.168.1.100".to_string()
}

fn default_server_port() -> u16 {
    32400
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl HubSettings {
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            ..Default::default()
        }
    }
}

impl Config {
    /// Reject configurations the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.plex.token.trim().is_empty() {
            bail!("Plex token is not configured (set PLEX_TOKEN or NOWPLAYING_PLEX__TOKEN)");
        }
        if self.plex.server_url.trim().is_empty() {
            bail!("Plex server URL is not configured");
        }
        Ok(())
    }
}

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NOWPLAYING_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

/// Get data directory (XDG_DATA_HOME or platform default); holds the state
/// file and the artwork cache
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NOWPLAYING_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from("./data")
}

fn env_port(var: &str) -> Option<u16> {
    std::env::var(var).ok().and_then(|v| v.trim().parse::<u16>().ok())
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        .set_default("plex.server_url", default_server_url())?
        .set_default("plex.server_port", default_server_port() as i64)?
        .set_default("hub.heartbeat_secs", default_heartbeat_secs() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Listen port precedence: NOWPLAYING_PORT > BACKEND_PORT > PORT > file > default
    let port = env_port("NOWPLAYING_PORT")
        .or_else(|| env_port("BACKEND_PORT"))
        .or_else(|| env_port("PORT"));
    if let Some(port) = port {
        builder = builder.set_override("port", port as i64)?;
    }

    for (key, prefixed, legacy) in LEGACY_STRING_VARS {
        if std::env::var(prefixed).is_ok() {
            continue;
        }
        if let Ok(value) = std::env::var(legacy) {
            builder = builder.set_override(*key, value)?;
        }
    }

    // Always a string, even when the token happens to be all digits
    if let Ok(token) = std::env::var("NOWPLAYING_PLEX__TOKEN") {
        builder = builder.set_override("plex.token", token)?;
    }

    if std::env::var("NOWPLAYING_PLEX__SERVER_PORT").is_err() {
        if let Some(port) = env_port("PLEX_SERVER_PORT") {
            builder = builder.set_override("plex.server_port", port as i64)?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const MANAGED_VARS: &[&str] = &[
        "NOWPLAYING_CONFIG_DIR",
        "NOWPLAYING_DATA_DIR",
        "NOWPLAYING_PORT",
        "NOWPLAYING_PLEX__TOKEN",
        "NOWPLAYING_PLEX__USERNAME",
        "NOWPLAYING_PLEX__SERVER_URL",
        "NOWPLAYING_PLEX__SERVER_PORT",
        "NOWPLAYING_HUB__HEARTBEAT_SECS",
        "BACKEND_PORT",
        "PORT",
        "PLEX_SERVER_URL",
        "PLEX_SERVER_PORT",
        "PLEX_TOKEN",
        "PLEX_USERNAME",
    ];

    fn reset_env() {
        for var in MANAGED_VARS {
            env::remove_var(var);
        }
        env::set_var("NOWPLAYING_CONFIG_DIR", "/tmp/nowplaying-test-nonexistent");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset_env();
        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.port, 3001);
        assert_eq!(config.plex.server_url, "192.168.1.100");
        assert_eq!(config.plex.server_port, 32400);
        assert_eq!(config.plex.token, "");
        assert_eq!(config.hub.heartbeat_secs, 30);
        assert!(!config.plex.accept_invalid_certs);
    }

    #[test]
    #[serial]
    fn test_legacy_plex_env_vars() {
        reset_env();
        env::set_var("PLEX_SERVER_URL", "10.0.0.2");
        env::set_var("PLEX_SERVER_PORT", "32401");
        env::set_var("PLEX_TOKEN", "legacy-token");
        env::set_var("PLEX_USERNAME", "themikez");

        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.plex.server_url, "10.0.0.2");
        assert_eq!(config.plex.server_port, 32401);
        assert_eq!(config.plex.token, "legacy-token");
        assert_eq!(config.plex.username, "themikez");
    }

    #[test]
    #[serial]
    fn test_prefixed_env_beats_legacy() {
        reset_env();
        env::set_var("PLEX_TOKEN", "legacy-token");
        env::set_var("NOWPLAYING_PLEX__TOKEN", "new-token");
        env::set_var("NOWPLAYING_HUB__HEARTBEAT_SECS", "5");

        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.plex.token, "new-token");
        assert_eq!(config.hub.heartbeat_secs, 5);
        assert_eq!(
            config.hub.to_hub_config().heartbeat_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    #[serial]
    fn test_numeric_token_stays_a_string() {
        reset_env();
        env::set_var("NOWPLAYING_PLEX__TOKEN", "123456");

        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.plex.token, "123456");
    }

    #[test]
    #[serial]
    fn test_port_precedence() {
        reset_env();
        env::set_var("PORT", "4000");
        env::set_var("BACKEND_PORT", "5000");
        let backend = load_config().expect("config should load");

        env::set_var("NOWPLAYING_PORT", "6000");
        let prefixed = load_config().expect("config should load");

        env::remove_var("NOWPLAYING_PORT");
        env::remove_var("BACKEND_PORT");
        let plain = load_config().expect("config should load");
        reset_env();

        assert_eq!(backend.port, 5000);
        assert_eq!(prefixed.port, 6000);
        assert_eq!(plain.port, 4000);
    }

    #[test]
    #[serial]
    fn test_invalid_port_uses_default() {
        reset_env();
        env::set_var("PORT", "not-a-port");

        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.port, 3001);
    }

    #[test]
    #[serial]
    fn test_config_file_is_read() {
        reset_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 3100\n[plex]\nserver_url = \"https://plex.example.com\"\ntoken = \"file-token\"\nusername = \"alice\"\n",
        )
        .unwrap();
        env::set_var("NOWPLAYING_CONFIG_DIR", dir.path());

        let config = load_config().expect("config should load");
        reset_env();

        assert_eq!(config.port, 3100);
        assert_eq!(config.plex.server_url, "https://plex.example.com");
        assert_eq!(config.plex.token, "file-token");
        assert_eq!(config.plex.username, "alice");
        assert_eq!(config.plex.server_port, 32400);
    }

    #[test]
    #[serial]
    fn test_validate_requires_token() {
        reset_env();
        let config = load_config().expect("config should load");
        assert!(config.validate().is_err());

        env::set_var("PLEX_TOKEN", "abc");
        let config = load_config().expect("config should load");
        reset_env();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_dir_overrides() {
        reset_env();
        env::set_var("NOWPLAYING_DATA_DIR", "/tmp/nowplaying-data");
        env::set_var("NOWPLAYING_CONFIG_DIR", "/tmp/nowplaying-config");

        let data = get_data_dir();
        let config = get_config_dir();
        reset_env();

        assert_eq!(data, PathBuf::from("/tmp/nowplaying-data"));
        assert_eq!(config, PathBuf::from("/tmp/nowplaying-config"));
    }
}
