use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::schema::{parse_schema, TableSchema};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub device: DeviceConfig,
    pub store: StoreConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_key_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("id_rsa")
}

impl TunnelConfig {
    /// Known hosts file used for trust-on-first-use host verification.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("known_hosts")
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub location: String,
    pub name: String,
}

impl DeviceConfig {
    /// Topic carrying every message published for this device.
    pub fn topic(&self) -> String {
        format!("{}/{}/#", self.location, self.name)
    }
}

#[derive(Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

// Keep the password out of logs and panics.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}
fn default_db_port() -> u16 {
    3306
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    pub columns: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Largest MQTT packet accepted or sent, in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: None,
            max_packet_size: default_max_packet_size(),
        }
    }
}

fn default_retry_delay_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}

impl IngestConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// The parsed table schema. Always succeeds for a config returned by
    /// [`load_config`].
    pub fn table_schema(&self) -> Result<TableSchema> {
        parse_schema(&self.schema.columns).context("Invalid schema.columns")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let required = [
        ("tunnel.host", &config.tunnel.host),
        ("tunnel.username", &config.tunnel.username),
        ("device.location", &config.device.location),
        ("device.name", &config.device.name),
        ("store.host", &config.store.host),
        ("store.username", &config.store.username),
        ("store.database", &config.store.database),
        ("ingest.broker_host", &config.ingest.broker_host),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            anyhow::bail!("{} must not be empty", field);
        }
    }

    if config.tunnel.port == 0 || config.store.port == 0 || config.ingest.broker_port == 0 {
        anyhow::bail!("tunnel.port, store.port and ingest.broker_port must be > 0");
    }

    if config.ingest.poll_interval_ms == 0 {
        anyhow::bail!("ingest.poll_interval_ms must be > 0");
    }

    if config.ingest.max_packet_size == 0 {
        anyhow::bail!("ingest.max_packet_size must be > 0");
    }

    // A persistent MQTT session needs a client id.
    if let Some(id) = &config.ingest.client_id {
        if id.trim().is_empty() {
            anyhow::bail!("ingest.client_id must not be empty");
        }
    }

    // The schema must parse before anything touches the network.
    config.table_schema()?;

    Ok(())
}
