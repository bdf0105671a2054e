use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    #[serde(default = "default_store_config")]
    pub store: StoreConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// How to launch the source-platform bridge process for one user
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

/// Inclusive range of milliseconds a randomized pause is drawn from
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    #[cfg(test)]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }
}

/// Outbound pacing. Every send and deletion waits a jittered delay so the
/// source platform does not flag the account for automation.
#[derive(Debug, Deserialize, Clone)]
pub struct PacingConfig {
    #[serde(default = "default_text_send")]
    pub text_send: DelayRange,
    #[serde(default = "default_media_send")]
    pub media_send: DelayRange,
    #[serde(default = "default_between_sends")]
    pub between_sends: DelayRange,
    #[serde(default = "default_between_deletions")]
    pub between_deletions: DelayRange,
    #[serde(default = "default_delete_item")]
    pub delete_item: DelayRange,
    #[serde(default = "default_secondary_retry_ms")]
    pub secondary_retry_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            text_send: default_text_send(),
            media_send: default_media_send(),
            between_sends: default_between_sends(),
            between_deletions: default_between_deletions(),
            delete_item: default_delete_item(),
            secondary_retry_ms: default_secondary_retry_ms(),
        }
    }
}

impl PacingConfig {
    pub fn secondary_retry_delay(&self) -> Duration {
        Duration::from_millis(self.secondary_retry_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_qr_poll_interval_ms")]
    pub qr_poll_interval_ms: u64,
    #[serde(default = "default_qr_poll_attempts")]
    pub qr_poll_attempts: u32,
    #[serde(default = "default_reset_cooldown_ms")]
    pub reset_cooldown_ms: u64,
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    #[serde(default = "default_init_backoff_ms")]
    pub init_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qr_poll_interval_ms: default_qr_poll_interval_ms(),
            qr_poll_attempts: default_qr_poll_attempts(),
            reset_cooldown_ms: default_reset_cooldown_ms(),
            init_attempts: default_init_attempts(),
            init_backoff_ms: default_init_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    /// Pool of bots handed out to users, one bot per user
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BotConfig {
    pub name: String,
    pub token: String,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chatrelay.db")
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
    }
}

fn default_store_config() -> StoreConfig {
    StoreConfig {
        database_path: default_db_path(),
    }
}

fn default_text_send() -> DelayRange {
    DelayRange::new(1000, 2000)
}

fn default_media_send() -> DelayRange {
    DelayRange::new(2000, 2500)
}

fn default_between_sends() -> DelayRange {
    DelayRange::new(13000, 15000)
}

fn default_between_deletions() -> DelayRange {
    DelayRange::new(3000, 5000)
}

fn default_delete_item() -> DelayRange {
    DelayRange::new(1000, 2000)
}

fn default_secondary_retry_ms() -> u64 {
    1000
}

fn default_qr_poll_interval_ms() -> u64 {
    500
}

fn default_qr_poll_attempts() -> u32 {
    20
}

fn default_reset_cooldown_ms() -> u64 {
    5000
}

fn default_init_attempts() -> u32 {
    2
}

fn default_init_backoff_ms() -> u64 {
    5000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)?;

        if !config.bridge.session_dir.exists() {
            std::fs::create_dir_all(&config.bridge.session_dir).with_context(|| {
                format!(
                    "Failed to create session directory: {}",
                    config.bridge.session_dir.display()
                )
            })?;
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        for (name, range) in [
            ("text_send", config.pacing.text_send),
            ("media_send", config.pacing.media_send),
            ("between_sends", config.pacing.between_sends),
            ("between_deletions", config.pacing.between_deletions),
            ("delete_item", config.pacing.delete_item),
        ] {
            if range.min_ms > range.max_ms {
                anyhow::bail!(
                    "pacing.{} has min_ms {} greater than max_ms {}",
                    name,
                    range.min_ms,
                    range.max_ms
                );
            }
        }
        if config.session.init_attempts == 0 {
            anyhow::bail!("session.init_attempts must be at least 1");
        }

        Ok(config)
    }
}
