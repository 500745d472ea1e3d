//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The file path
//! comes from `--config`, then CONFIG_PATH. The file may be absent when
//! CLIENT_ID is set, so a container can be configured from the
//! environment alone:
//!
//! | Variable        | Field                          |
//! |-----------------|--------------------------------|
//! | `CLIENT_ID`     | `oauth.client_id`              |
//! | `CLIENT_SECRET` | client secret (never in TOML)  |
//! | `CLIENT_SCOPES` | `oauth.scopes`                 |
//! | `HOST`, `PORT`  | `proxy.listen_addr`            |
//! | `MQTT_HOST`     | `mqtt.host`                    |
//! | `MQTT_PORT`     | `mqtt.port`                    |
//! | `MQTT_TOPIC`    | `mqtt.root_topic`              |
//!
//! The client secret is loaded from the CLIENT_SECRET env var or
//! `oauth.client_secret_file`, never stored in the TOML directly.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use event_bridge::MqttSettings;
use homeconnect_auth::{ClientCredentials, ClientSecret};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Registered application identity and vendor OAuth endpoints
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<ClientSecret>,
    /// Path to a file containing the client secret (alternative to the
    /// CLIENT_SECRET env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// HTTP listener and forwarding settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
}

/// MQTT broker the decoded events are published to
#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long a publish may wait for the client's request queue
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

/// Upstream event stream → MQTT bridge
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Silence after which an open stream is treated as lost
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_scopes() -> String {
    "IdentifyAppliance Monitor".to_string()
}

fn default_authorize_url() -> String {
    homeconnect_auth::AUTHORIZE_ENDPOINT.to_string()
}

fn default_token_url() -> String {
    homeconnect_auth::TOKEN_ENDPOINT.to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8088))
}

fn default_base_url() -> String {
    homeconnect_auth::API_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_token_path() -> PathBuf {
    PathBuf::from("data/token.cache")
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "homeconnect-proxy".to_string()
}

fn default_root_topic() -> String {
    "hc-proxy".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_events_path() -> String {
    homeconnect_auth::EVENTS_PATH.to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_in_flight() -> usize {
    16
}

fn default_idle_timeout() -> u64 {
    event_bridge::bridge::DEFAULT_IDLE_TIMEOUT.as_secs()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            scopes: default_scopes(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            redirect_uri: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            root_topic: default_root_topic(),
            keep_alive_secs: default_keep_alive(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            events_path: default_events_path(),
            channel_capacity: default_channel_capacity(),
            max_in_flight: default_max_in_flight(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn require_http_url(field: &str, value: &str) -> Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    reqwest::Url::parse(value)
        .map_err(|e| Error::Config(format!("{field} is not a valid URL ({e}): {value}")))?;
    Ok(())
}

/// Non-empty, trimmed value of an environment variable.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_port(var: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{var} must be a port number, got: {value}")))
}

fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("HOST {host} does not resolve: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("HOST {host} does not resolve")))
}

fn require_non_zero(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{field} must be greater than 0")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// A missing file is only accepted when CLIENT_ID is set.
    ///
    /// Client secret resolution order:
    /// 1. CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    && env_value("CLIENT_ID").is_some() =>
            {
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env()?;
        config.validate()?;

        if let Ok(secret) = std::env::var("CLIENT_SECRET") {
            config.oauth.client_secret = Some(ClientSecret::new(secret.trim()));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            config.oauth.client_secret = Some(ClientSecret::new(secret.trim()));
        }

        match config.oauth.client_secret {
            Some(ref secret) if !secret.is_empty() => Ok(config),
            _ => Err(Error::Config(
                "client secret missing: set CLIENT_SECRET or oauth.client_secret_file".into(),
            )),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(client_id) = env_value("CLIENT_ID") {
            self.oauth.client_id = client_id;
        }
        if let Some(scopes) = env_value("CLIENT_SCOPES") {
            self.oauth.scopes = scopes;
        }

        let host = env_value("HOST");
        let port = env_value("PORT");
        if host.is_some() || port.is_some() {
            let port = match port {
                Some(p) => parse_port("PORT", &p)?,
                None => self.proxy.listen_addr.port(),
            };
            let host = host.unwrap_or_else(|| self.proxy.listen_addr.ip().to_string());
            self.proxy.listen_addr = resolve_listen_addr(&host, port)?;
        }

        if let Some(host) = env_value("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env_value("MQTT_PORT") {
            self.mqtt.port = parse_port("MQTT_PORT", &port)?;
        }
        if let Some(topic) = env_value("MQTT_TOPIC") {
            self.mqtt.root_topic = topic;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(Error::Config("oauth.client_id must not be empty".into()));
        }
        require_http_url("oauth.authorize_url", &self.oauth.authorize_url)?;
        require_http_url("oauth.token_url", &self.oauth.token_url)?;
        require_http_url("proxy.base_url", &self.proxy.base_url)?;

        require_non_zero("proxy.timeout_secs", self.proxy.timeout_secs)?;
        require_non_zero("proxy.max_connections", self.proxy.max_connections as u64)?;
        require_non_zero("bridge.channel_capacity", self.bridge.channel_capacity as u64)?;
        require_non_zero("bridge.max_in_flight", self.bridge.max_in_flight as u64)?;
        require_non_zero("bridge.idle_timeout_secs", self.bridge.idle_timeout_secs)?;
        require_non_zero("mqtt.publish_timeout_secs", self.mqtt.publish_timeout_secs)?;

        if self.mqtt.root_topic.trim_matches('/').is_empty() {
            return Err(Error::Config("mqtt.root_topic must not be empty".into()));
        }
        // rumqttc rejects keep-alive intervals below 5 seconds
        if self.mqtt.keep_alive_secs < 5 {
            return Err(Error::Config("mqtt.keep_alive_secs must be at least 5".into()));
        }
        if !self.bridge.events_path.starts_with('/') {
            return Err(Error::Config(format!(
                "bridge.events_path must start with '/', got: {}",
                self.bridge.events_path
            )));
        }
        Ok(())
    }

    /// Application identity handed to the token manager. `None` until the
    /// secret has been resolved by `load`.
    pub fn client_credentials(&self) -> Option<ClientCredentials> {
        let client_secret = self.oauth.client_secret.clone()?;
        Some(ClientCredentials {
            client_id: self.oauth.client_id.clone(),
            client_secret,
            scopes: self.oauth.scopes.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
        })
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            publish_timeout: Duration::from_secs(self.mqtt.publish_timeout_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("homeconnect-proxy.toml")
    }
}
