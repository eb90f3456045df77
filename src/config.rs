use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Same-origin base URL; anything else is treated as cross-origin
  pub origin: String,
  /// Path prefix of the API namespace (Network-First)
  pub api_prefix: String,
  /// Path of the page served when a page or asset is unavailable offline
  pub offline_page: String,
  /// Directory holding the cache databases and logs
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub worker: WorkerConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      worker: WorkerConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Family prefix shared by every cache namespace
  pub prefix: String,
  /// Version suffix; namespaces of other versions are dropped on activation
  pub version: String,
  /// File extensions (without the dot) served Cache-First
  pub static_extensions: Vec<String>,
  /// Document paths served Cache-First
  pub root_documents: Vec<String>,
  /// Paths that are never cached. `*` is a wildcard at either end.
  pub exclude: Vec<String>,
  /// Resources fetched into the static cache on install
  pub precache: Vec<String>,
  /// Lifetime of parsed API responses in the durable API cache
  pub api_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();

    Self {
      prefix: "tether".to_string(),
      version: "v1".to_string(),
      static_extensions: strings(&[
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
        "eot",
      ]),
      root_documents: strings(&["/", "/index.html"]),
      exclude: strings(&[
        "/api/auth/*",
        "/api/login*",
        "/api/logout*",
        "*/socket.*",
        "*.json",
      ]),
      precache: strings(&["/", "/index.html", "/offline.html"]),
      api_ttl_secs: 5 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background-sync tag the worker reacts to
  pub tag: String,
  /// Failed replays after which an operation is parked
  pub max_retries: u32,
  pub backoff_base_secs: u64,
  pub backoff_cap_secs: u64,
  /// How long synced operations are kept before pruning
  pub synced_retention_hours: u64,
  /// Header carrying the idempotency key on replay; `null` disables it
  pub idempotency_header: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "tether-sync".to_string(),
      max_retries: 8,
      backoff_base_secs: 2,
      backoff_cap_secs: 5 * 60,
      synced_retention_hours: 7 * 24,
      idempotency_header: Some("Idempotency-Key".to_string()),
    }
  }
}

impl SyncConfig {
  pub fn backoff_base(&self) -> Duration {
    Duration::from_secs(self.backoff_base_secs)
  }

  pub fn backoff_cap(&self) -> Duration {
    Duration::from_secs(self.backoff_cap_secs)
  }

  pub fn synced_retention(&self) -> Duration {
    Duration::from_secs(self.synced_retention_hours * 60 * 60)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Activate right after install instead of waiting for a skip-waiting message
  pub skip_waiting: bool,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tether.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tether/config.yaml
  ///
  /// Falls back to the defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tether.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tether").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    if !self.offline_page.starts_with('/') {
      return Err(eyre!(
        "offline_page must start with '/': {}",
        self.offline_page
      ));
    }
    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("cache prefix and version must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the configured origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path_or_url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path_or_url, e))
  }

  /// Directory for the databases, `$XDG_DATA_HOME/tether` unless overridden.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tether"))
  }

  pub fn api_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.api_ttl_secs)
  }

  /// Get the bearer token sent with every network request.
  ///
  /// Checks TETHER_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TETHER_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
