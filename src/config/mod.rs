//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::auth::PersistentStore;
use crate::error::SyncError;

const DEFAULT_API_BASE: &str = "http://localhost:3000/api";

fn default_public_paths() -> Vec<String> {
    vec![
        "/auth/login".to_string(),
        "/auth/refresh".to_string(),
        "/auth/register".to_string(),
        "/public/".to_string(),
    ]
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST API base URL
    pub api_base_url: String,
    /// Realtime endpoint; derived from `api_base_url` when unset
    pub realtime_url: Option<String>,
    /// Prefix for persisted token keys
    pub storage_prefix: String,
    /// Path prefixes that are sent without credentials
    pub public_paths: Vec<String>,
    /// Refresh this long before the access token expires
    pub refresh_buffer_secs: u64,
    /// Applies to HTTP calls, refresh and the realtime handshake
    pub request_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_sweep_secs: u64,
    /// Repeated realtime events inside this window are dropped
    pub dedup_window_ms: u64,
    /// Maximum number of event ids remembered for dedup
    pub recent_window_cap: usize,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            realtime_url: None,
            storage_prefix: String::new(),
            public_paths: default_public_paths(),
            refresh_buffer_secs: 300,
            request_timeout_secs: 30,
            cache_ttl_secs: 300,
            cache_sweep_secs: 60,
            dedup_window_ms: 5000,
            recent_window_cap: 100,
            reconnect_max_attempts: 5,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "desk-sync", "desk-sync")
            .context("Could not determine config directory")
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        write_private(&path, &content)
    }

    /// Realtime endpoint. Without an explicit setting, the API URL's scheme
    /// is switched to ws/wss and any path is dropped.
    pub fn realtime_url(&self) -> String {
        if let Some(ref url) = self.realtime_url {
            return url.clone();
        }
        match url::Url::parse(&self.api_base_url) {
            Ok(mut u) => {
                let scheme = if u.scheme() == "https" { "wss" } else { "ws" };
                // set_scheme only fails for special/non-special mismatches,
                // which http(s) -> ws(s) is not.
                let _ = u.set_scheme(scheme);
                u.set_path("/");
                u.set_query(None);
                u.to_string()
            }
            Err(_) => self
                .api_base_url
                .replace("https://", "wss://")
                .replace("http://", "ws://"),
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_max_ms.max(self.reconnect_delay_ms))
    }
}

/// Write a file readable only by the owner (it may contain tokens).
fn write_private(path: &std::path::Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("Failed to create config directory")?;
    }
    fs::write(path, content).context("Failed to write file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms).context("Failed to set file permissions")?;
    }

    Ok(())
}

/// Persistent key/value store backed by a TOML file in the data directory.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the default store (`<data_dir>/store.toml`).
    pub fn open_default() -> Result<Self> {
        let dirs = Config::project_dirs()?;
        Self::open(dirs.data_dir().join("store.toml"))
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read store file")?;
            toml::from_str(&content).context("Failed to parse store file")?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> std::result::Result<(), SyncError> {
        let content =
            toml::to_string_pretty(values).map_err(|e| SyncError::Storage(e.to_string()))?;
        write_private(&self.path, &content).map_err(|e| SyncError::Storage(format!("{:#}", e)))
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> std::result::Result<(), SyncError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), SyncError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".to_string()))?;
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}
