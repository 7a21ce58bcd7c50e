//! # dvault-config
//!
//! Configuration management for dvault.
//!
//! Loads configuration from:
//! 1. `~/.dvault/config.toml` (global)
//! 2. `.dvault/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub compaction: CompactionConfig,
    pub gc: GcConfig,
    pub daemon: DaemonConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::from_files(global.as_deref(), Some(Path::new(".dvault/config.toml")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Layer a project file over a global one. Missing files are skipped.
    ///
    /// The merge is per key: a project file that only sets `[gc] rounds`
    /// keeps every other global setting.
    pub fn from_files(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Value = toml::from_str(&contents)?;
            merge_values(&mut merged, layer);
        }

        Ok(merged.try_into()?)
    }

    /// Global config path: ~/.dvault/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".dvault/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("DVAULT_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(listen) = lookup("DVAULT_LISTEN") {
            self.daemon.listen = listen;
        }
        if let Some(server) = lookup("DVAULT_SERVER") {
            self.client.server = server;
        }
        if let Some(reserved) = lookup("DVAULT_RESERVED") {
            match reserved.parse() {
                Ok(bytes) => self.storage.reserved_capacity = bytes,
                Err(_) => debug!("Ignoring unparsable DVAULT_RESERVED={:?}", reserved),
            }
        }
    }

    /// Store root with a leading `~/` expanded.
    pub fn store_root(&self) -> PathBuf {
        expand_tilde(&self.storage.root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root directory (index, scripts and block payloads)
    pub root: PathBuf,
    /// Bytes the store may occupy on disk before GC kicks in
    pub reserved_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.dvault/store"),
            reserved_capacity: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Version compaction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Maximum run of script-form versions after a block-form one (0 disables scripts)
    pub script_limit: usize,
    /// Enable the diff engine's progress heuristic
    pub heuristic: bool,
    /// Edit ceiling as a fraction of base + target length
    pub max_edit_ratio: f64,
    /// Versions larger than this are never diffed
    pub max_script_input: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            script_limit: 2,
            heuristic: true,
            max_edit_ratio: 0.5,
            max_script_input: 8 * 1024 * 1024,
        }
    }
}

/// Garbage collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Reclaim rounds attempted before an operation fails for lack of space
    pub rounds: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { rounds: 3 }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP listen address
    pub listen: String,
    /// Largest accepted frame in bytes
    pub max_frame: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7341".to_string(),
            max_frame: 16 * 1024 * 1024,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address the CLI connects to
    pub server: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7341".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.compaction.script_limit, 2);
        assert_eq!(config.gc.rounds, 3);
        assert_eq!(config.storage.reserved_capacity, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[compaction]"));
        assert!(toml_str.contains("script_limit = 2"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_merge_keeps_unset_keys() {
        let mut base: toml::Value = toml::from_str("[gc]\nrounds = 5\n[daemon]\nlisten = \"a:1\"").unwrap();
        let overlay: toml::Value = toml::from_str("[daemon]\nmax_frame = 10").unwrap();
        merge_values(&mut base, overlay);

        let config: Config = base.try_into().unwrap();
        assert_eq!(config.gc.rounds, 5);
        assert_eq!(config.daemon.listen, "a:1");
        assert_eq!(config.daemon.max_frame, 10);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "DVAULT_ROOT" => Some("/srv/vault".to_string()),
            "DVAULT_RESERVED" => Some("4096".to_string()),
            _ => None,
        });
        assert_eq!(config.storage.root, PathBuf::from("/srv/vault"));
        assert_eq!(config.storage.reserved_capacity, 4096);
        assert_eq!(config.daemon.listen, "127.0.0.1:7341");
    }

    #[test]
    fn test_bad_reserved_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| (key == "DVAULT_RESERVED").then(|| "lots".to_string()));
        assert_eq!(config.storage.reserved_capacity, StorageConfig::default().reserved_capacity);
    }

    #[test]
    fn test_expand_tilde() {
        let absolute = Path::new("/var/lib/dvault");
        assert_eq!(expand_tilde(absolute), absolute);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/store")), home.join("store"));
        }
    }
}
