//! Persisted Settings
//!
//! The flat settings record shared with the UI, plus the crash-recovery
//! fields that say whether this application left a system proxy pointed
//! at the relay.
//!
//! The on-disk format is camelCase JSON:
//!
//! ```json
//! {
//!   "resolver": "8.8.8.8:53",
//!   "domain": "s.example.com",
//!   "mode": "proxy",
//!   "verbose": false,
//!   "socks5AuthEnabled": false,
//!   "socks5AuthUsername": "",
//!   "socks5AuthPassword": "",
//!   "systemProxyEnabledByApp": false,
//!   "systemProxyServiceName": ""
//! }
//! ```

use crate::config::Resolver;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

/// Settings record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// DNS resolver handed to the tunnel client
    pub resolver: String,
    /// Tunnel domain
    pub domain: String,
    /// `proxy` (TUN mode is handled outside this crate)
    pub mode: String,
    /// High-frequency relay diagnostics
    pub verbose: bool,
    /// Present credentials on every SOCKS5 handshake
    pub socks5_auth_enabled: bool,
    pub socks5_auth_username: String,
    pub socks5_auth_password: String,
    /// Crash recovery: did we leave a system proxy enabled?
    pub system_proxy_enabled_by_app: bool,
    /// Crash recovery: which target we enabled
    pub system_proxy_service_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resolver: "8.8.8.8:53".to_string(),
            domain: "s.example.com".to_string(),
            mode: "proxy".to_string(),
            verbose: false,
            socks5_auth_enabled: false,
            socks5_auth_username: String::new(),
            socks5_auth_password: String::new(),
            system_proxy_enabled_by_app: false,
            system_proxy_service_name: String::new(),
        }
    }
}

impl Settings {
    /// Current system proxy binding
    pub fn binding(&self) -> SystemProxyBinding {
        SystemProxyBinding {
            target: Some(self.system_proxy_service_name.clone()).filter(|t| !t.is_empty()),
            owned_by_us: self.system_proxy_enabled_by_app,
        }
    }

    /// Record a system proxy binding
    pub fn set_binding(&mut self, binding: &SystemProxyBinding) {
        self.system_proxy_enabled_by_app = binding.owned_by_us;
        self.system_proxy_service_name = binding.target.clone().unwrap_or_default();
    }

    /// SOCKS5 credentials, if authentication is enabled and complete
    pub fn socks5_credentials(&self) -> Option<(String, String)> {
        if self.socks5_auth_enabled
            && !self.socks5_auth_username.is_empty()
            && !self.socks5_auth_password.is_empty()
        {
            Some((
                self.socks5_auth_username.clone(),
                self.socks5_auth_password.clone(),
            ))
        } else {
            None
        }
    }

    /// Store a resolver, normalized to the standard DNS port
    pub fn set_resolver(&mut self, raw: &str) -> Result<Resolver, SettingsError> {
        let resolver = Resolver::parse(raw)
            .ok_or_else(|| SettingsError::InvalidResolver(raw.to_string()))?
            .normalized();
        self.resolver = resolver.to_string();
        Ok(resolver)
    }
}

/// Which OS proxy target points at the relay, and whether we set it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProxyBinding {
    /// Network service / mechanism identifier (`Wi-Fi`, `winhttp`, `gsettings`)
    pub target: Option<String>,
    /// This process enabled it
    pub owned_by_us: bool,
}

impl SystemProxyBinding {
    /// Binding owned by us on `target`
    pub fn owned(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            owned_by_us: true,
        }
    }

    /// Nothing recorded
    pub fn none() -> Self {
        Self::default()
    }
}

/// Settings persistence collaborator
pub trait SettingsStore: Send + Sync {
    /// Load the record; missing storage yields defaults
    fn load(&self) -> Result<Settings, SettingsError>;

    /// Persist the record
    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            debug!("No settings at {}, using defaults", self.path.display());
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory store
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<Settings>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new(initial: Settings) -> Self {
        Self {
            saved: Mutex::new(Some(initial)),
        }
    }

    /// Last persisted record
    pub fn snapshot(&self) -> Option<Settings> {
        self.saved.lock().ok().and_then(|s| s.clone())
    }
}

#[cfg(test)]
impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.snapshot().unwrap_or_default())
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let mut saved = self.saved.lock().map_err(|_| SettingsError::Poisoned)?;
        *saved = Some(settings.clone());
        Ok(())
    }
}

/// Live settings shared between components, backed by a store
#[derive(Clone)]
pub struct SharedSettings {
    current: Arc<Mutex<Settings>>,
    store: Arc<dyn SettingsStore>,
}

impl SharedSettings {
    /// Load from the store (falls back to defaults on a broken record)
    pub fn load(store: Arc<dyn SettingsStore>) -> Self {
        let settings = match store.load() {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings: {}", e);
                Settings::default()
            }
        };
        Self {
            current: Arc::new(Mutex::new(settings)),
            store,
        }
    }

    /// Snapshot of the current record
    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    /// Mutate in memory, then persist.
    ///
    /// The in-memory change stands even if the write fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        let (result, snapshot) = {
            let mut settings = self.lock();
            let result = f(&mut settings);
            (result, settings.clone())
        };
        if let Err(e) = self.store.save(&snapshot) {
            error!("Failed to save settings: {}", e);
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid DNS resolver {0:?}. Use IPv4:port (e.g. 1.1.1.1:53)")]
    InvalidResolver(String),

    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Settings lock poisoned")]
    Poisoned,
}
