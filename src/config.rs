use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::storage::DEFAULT_NAMESPACE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base url relative endpoints are resolved against
  pub base_url: Option<String>,
  /// Prefix for persisted record keys
  #[serde(default = "default_namespace")]
  pub namespace: String,
  /// Headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      base_url: None,
      namespace: default_namespace(),
      headers: BTreeMap::new(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }
}

fn default_namespace() -> String {
  DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Nothing is persisted
  None,
  /// Persist for the lifetime of the process only
  Memory,
  /// SQLite database, survives restarts
  #[default]
  Sqlite,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
  /// Records are restored while a query is constructed
  #[default]
  Sync,
  /// Records are restored when a query mounts
  Async,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  #[serde(default)]
  pub mode: StorageMode,
  /// Database path for the sqlite backend (default: $XDG_DATA_HOME/netquery/storage.db)
  pub path: Option<PathBuf>,
  /// Purge the namespace when the provider starts
  #[serde(default)]
  pub clear_on_start: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./netquery.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/netquery/config.yaml
  ///
  /// Without an explicit path, a missing file yields the defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("netquery.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("netquery").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Bearer token from the environment, if one is set.
  ///
  /// Checks NETQUERY_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("NETQUERY_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
