use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use auroraproxy::transport::MAX_MESSAGE_LEN;
use auroraproxy::SessionConfig;
use serde::Deserialize;

const USER_PATH: &str = "auroraproxy/config.toml";
const ENV_PREFIX: &str = "AURORAPROXY";

const DEFAULT_ORIGIN_HOST: &str = "mirea.aco-avrora.ru";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.2; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) QtWebEngine/5.14.2 Chrome/77.0.3865.129 Safari/537.36";

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    profile: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Host serving both the pages and the WebSocket endpoint.
    pub origin_host: String,
    pub upstream_port: u16,
    /// Resource requested in the upstream WebSocket handshake.
    pub ws_path: String,
    pub user_agent: String,
    pub relay_listen: SocketAddr,
    pub gateway_listen: SocketAddr,
    /// Prepended to request paths that do not already contain it.
    pub path_prefix: String,
    /// Pages whose WebSocket endpoint is redirected to the relay.
    pub rewrite_pages: Vec<String>,
    /// Script expression the pages use to build the WebSocket address.
    pub endpoint_reference: String,
    pub script_rewrites: Vec<ScriptRewrite>,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
    /// Ceiling on a reassembled fragmented WebSocket message.
    pub max_message_len: usize,
}

/// Literal substitution applied to responses whose path contains `marker`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptRewrite {
    pub marker: String,
    pub find: String,
    pub replace: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            origin_host: DEFAULT_ORIGIN_HOST.to_string(),
            upstream_port: 443,
            ws_path: "/student/arm/".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            relay_listen: SocketAddr::from(([127, 0, 0, 1], 500)),
            gateway_listen: SocketAddr::from(([127, 0, 0, 1], 80)),
            path_prefix: "/student".to_string(),
            rewrite_pages: vec!["/".to_string(), "/student/".to_string()],
            endpoint_reference: "+location.host+'/student/arm/'".to_string(),
            script_rewrites: Vec::new(),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

impl ProfileConfig {
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.origin_host.clone());
        config.path = self.ws_path.clone();
        config.user_agent = self.user_agent.clone();
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.idle_timeout = (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs));
        config.max_message_len = self.max_message_len;
        config
    }
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        user_config_dir().map(|dir| dir.join(USER_PATH))
    }

    /// Loads the user config file (or `path` when given), then applies
    /// `AURORAPROXY_`-prefixed environment overrides such as
    /// `AURORAPROXY_PROFILE__DEFAULT__ORIGIN_HOST`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = Self::user_path() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Settings of `name`, or the defaults if the profile is not configured.
    pub fn get_profile(&self, name: &str) -> ProfileConfig {
        self.profile.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(target_os = "windows")]
fn user_config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}

#[cfg(not(target_os = "windows"))]
fn user_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .and_then(dirs_sys::is_absolute_path)
        .or_else(|| dirs_sys::home_dir().map(|home| home.join(".config")))
}
