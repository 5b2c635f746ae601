//! Revloop configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RevloopError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevloopConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for RevloopConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            executor: ExecutorConfig::default(),
            channel: ChannelConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl RevloopConfig {
    /// Load config from the default path (~/.revloop/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RevloopError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RevloopError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RevloopError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Revloop home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".revloop")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.revloop/revloop.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret required in the X-Revloop-Secret header. Empty = open
    /// (local development only).
    #[serde(default)]
    pub shared_secret: String,
    /// HMAC key for provider webhook signature verification. Falls back to
    /// `shared_secret` when empty.
    #[serde(default)]
    pub webhook_signing_key: String,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8460
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shared_secret: String::new(),
            webhook_signing_key: String::new(),
        }
    }
}

/// Polling executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Seconds between in-process executor passes under `revloop serve`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Max due rows (jobs + enrollment steps each) claimed per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Delivery attempts per unit before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for transient-failure backoff (doubles per attempt).
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Rows stuck in `processing` longer than this are reclaimed.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Per-send delivery timeout.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    120
}
fn default_batch_size() -> u32 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    300
}
fn default_visibility_timeout_secs() -> u64 {
    600
}
fn default_send_timeout_secs() -> u64 {
    30
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Delivery transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub email: Option<EmailChannelConfig>,
    #[serde(default)]
    pub sms: Option<SmsChannelConfig>,
}

/// SMTP sending credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    pub username: String,
    pub password: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// HTTP SMS gateway credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Gateway endpoint, e.g. "https://sms.example.com/v1/messages".
    pub api_url: String,
    pub api_key: String,
    pub from_number: String,
}

/// Optional fire-and-forget event sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// URL receiving engine events as JSON POSTs. None = disabled.
    #[serde(default)]
    pub endpoint: Option<String>,
}
