use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::store::repo::KvStore;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";

pub const KEY_API_URL: &str = "apiUrl";
pub const KEY_TRACKING_ENABLED: &str = "trackingEnabled";
pub const KEY_TRACKED_EMAILS: &str = "trackedEmails";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Fr,
}

/// On-disk configuration (`config.toml`).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Endpoint used while the store holds no `apiUrl`.
    pub api_url: Option<String>,
    pub db_path: Option<String>,
    pub poll_interval_secs: u64,
    pub annotate_interval_secs: u64,
    pub locale: Locale,
    pub desktop_notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            db_path: None,
            poll_interval_secs: 30,
            annotate_interval_secs: 5,
            locale: Locale::En,
            desktop_notifications: true,
        }
    }
}

impl Config {
    pub fn default_api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_API_URL)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            annotate_interval: Duration::from_secs(self.annotate_interval_secs.max(1)),
            ..Timing::default()
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let p = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("no config dir available"))?
        .join("mail_beacon");
    fs::create_dir_all(&p)?;
    Ok(p)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("store.db"))
}

pub fn socket_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("daemon.sock"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Reads `path`, writing a default template first if it is missing.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let sample = Config::default();
        fs::write(path, toml::to_string_pretty(&sample)?)
            .with_context(|| format!("writing template config to {}", path.display()))?;
        log::info!("created template config at {}", path.display());
        return Ok(sample);
    }
    let s = fs::read_to_string(path)?;
    let cfg: Config =
        toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(cfg)
}

pub fn resolve_db_path(cfg: &Config) -> Result<PathBuf> {
    if let Some(p) = &cfg.db_path {
        Ok(PathBuf::from(p))
    } else {
        default_db_path()
    }
}

/// Every fixed delay the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait after discovering a compose surface before the first beacon insert.
    pub settle_delay: Duration,
    pub guard_interval: Duration,
    pub notification_ttl: Duration,
    pub poll_interval: Duration,
    pub annotate_interval: Duration,
    pub ready_probe_interval: Duration,
    pub ready_probe_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            guard_interval: Duration::from_secs(1),
            notification_ttl: Duration::from_secs(3),
            poll_interval: Duration::from_secs(30),
            annotate_interval: Duration::from_secs(5),
            ready_probe_interval: Duration::from_millis(500),
            ready_probe_attempts: 40,
        }
    }
}

/// Runtime settings shared through the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub tracking_enabled: bool,
}

impl Settings {
    /// Missing `trackingEnabled` means enabled; only an explicit `false` disables.
    pub fn load(kv: &dyn KvStore, default_api_url: &str) -> Result<Self> {
        let api_url = kv
            .get(KEY_API_URL)?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default_api_url.to_string());
        let tracking_enabled = kv
            .get(KEY_TRACKING_ENABLED)?
            .and_then(|v| v.as_bool())
            != Some(false);
        Ok(Self {
            api_url,
            tracking_enabled,
        })
    }
}

/// Keeps a `watch` channel of [`Settings`] in step with the store.
pub struct SettingsWatch;

impl SettingsWatch {
    /// Must be called from inside a tokio runtime. The refresh task ends once
    /// every receiver is dropped or the store's change feed closes.
    pub fn spawn(kv: Arc<dyn KvStore>, default_api_url: &str) -> Result<watch::Receiver<Settings>> {
        let initial = Settings::load(kv.as_ref(), default_api_url)?;
        let (tx, rx) = watch::channel(initial);
        let mut changes = kv.subscribe();
        let default_api_url = default_api_url.to_string();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(c) if c.key != KEY_API_URL && c.key != KEY_TRACKING_ENABLED => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                match Settings::load(kv.as_ref(), &default_api_url) {
                    Ok(s) => {
                        log::debug!("settings updated: {s:?}");
                        if tx.send(s).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("reloading settings failed: {e:#}"),
                }
            }
        });

        Ok(rx)
    }
}
