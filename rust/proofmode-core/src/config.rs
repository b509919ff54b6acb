use crate::ots::calendar::{UrlWhitelist, DEFAULT_CALENDAR_URLS, DEFAULT_WHITELIST};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "proofmode.json";
pub const DATA_DIR_ENV: &str = "PROOFMODE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofModeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub calendars: CalendarConfig,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub keys: KeyConfig,

    #[serde(default = "default_notarize_timeout")]
    pub notarize_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub notarize_ots: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_urls")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub private: Vec<PrivateCalendarConfig>,
    /// Successful calendar responses required; `None` picks the default.
    #[serde(default)]
    pub quorum: Option<usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            urls: default_calendar_urls(),
            private: Vec::new(),
            quorum: None,
            workers: default_workers(),
            timeout_secs: default_call_timeout(),
            whitelist: default_whitelist(),
        }
    }
}

impl CalendarConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whitelist patterns plus every configured calendar.
    pub fn url_whitelist(&self) -> UrlWhitelist {
        let mut whitelist = UrlWhitelist::new(&self.whitelist);
        for url in &self.urls {
            whitelist.add(url.trim_end_matches('/'));
        }
        for private in &self.private {
            whitelist.add(private.url.trim_end_matches('/'));
        }
        whitelist
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateCalendarConfig {
    pub url: String,
    /// Hex-encoded 32-byte ed25519 seed used for the `x-signature` header.
    pub signing_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub bitcoin_rpc_url: Option<String>,
    #[serde(default)]
    pub bitcoin_rpc_user: Option<String>,
    #[serde(default)]
    pub bitcoin_rpc_password: Option<String>,
    /// Esplora base URL for Bitcoin; `None` uses the public default.
    #[serde(default)]
    pub bitcoin_explorer_url: Option<String>,
    #[serde(default)]
    pub litecoin_explorer_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_false")]
    pub track_device_id: bool,
    #[serde(default = "default_true")]
    pub track_location: bool,
    #[serde(default = "default_true")]
    pub track_cell_info: bool,
    #[serde(default = "default_poll_attempts")]
    pub location_poll_attempts: u32,
    #[serde(default = "default_poll_interval")]
    pub location_poll_interval_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            track_device_id: false,
            track_location: true,
            track_cell_info: true,
            location_poll_attempts: default_poll_attempts(),
            location_poll_interval_ms: default_poll_interval(),
        }
    }
}

impl MetadataConfig {
    pub fn location_poll_interval(&self) -> Duration {
        Duration::from_millis(self.location_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_key_bits")]
    pub bits: usize,
    #[serde(default = "default_identity")]
    pub identity: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            bits: default_key_bits(),
            identity: default_identity(),
        }
    }
}

// Defaults
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_notarize_timeout() -> u64 {
    60
}
fn default_workers() -> usize {
    4
}
fn default_call_timeout() -> u64 {
    50
}
fn default_poll_attempts() -> u32 {
    3
}
fn default_poll_interval() -> u64 {
    500
}
fn default_key_bits() -> usize {
    2048
}

fn default_calendar_urls() -> Vec<String> {
    DEFAULT_CALENDAR_URLS.iter().map(|s| s.to_string()).collect()
}

fn default_whitelist() -> Vec<String> {
    DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect()
}

fn default_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("ProofMode <{user}@{host}>")
}

pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|h| h.join(".proofmode"))
        .unwrap_or_else(|| PathBuf::from(".proofmode"))
}

impl ProofModeConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let mut config: ProofModeConfig = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        Ok(Self::default_with_dir(data_dir))
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            calendars: CalendarConfig::default(),
            chain: ChainConfig::default(),
            metadata: MetadataConfig::default(),
            keys: KeyConfig::default(),
            notarize_timeout_secs: default_notarize_timeout(),
            notarize_ots: true,
        }
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        let config_path = self.data_dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, raw)
            .with_context(|| format!("writing {}", config_path.display()))?;
        Ok(())
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn proofs_dir(&self) -> PathBuf {
        self.data_dir.join("proofs")
    }

    pub fn notarize_timeout(&self) -> Duration {
        Duration::from_secs(self.notarize_timeout_secs)
    }
}
