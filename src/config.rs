use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CoordinatorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid config: {0}")]
  Parse(#[from] serde_yaml::Error),
}

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
pub fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    result.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      if let Some(end) = braced.find('}') {
        result.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
        rest = &braced[end + 1..];
        continue;
      }
      // Unterminated: keep the remainder verbatim
      result.push_str(&rest[pos..]);
      return result;
    }

    let name_len = after
      .chars()
      .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
      .count();
    if name_len == 0 {
      result.push('$');
    } else {
      result.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }

  result.push_str(rest);
  result
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  #[default]
  Redis,
  /// Process-local store, not shared with any render worker
  Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub redis: RedisSection,
  #[serde(default)]
  pub ttl: TtlSection,
  #[serde(default)]
  pub server: ServerSection,
  #[serde(default)]
  pub auth: AuthSection,
  #[serde(default)]
  pub logging: LoggingSection,
  #[serde(default)]
  pub memory: MemorySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
  #[serde(default = "default_redis_url")]
  pub url: String,
}
fn default_redis_url() -> String {
  "redis://127.0.0.1:6379/0".into()
}
impl Default for RedisSection {
  fn default() -> Self {
    Self {
      url: default_redis_url(),
    }
  }
}

/// Render cache timings, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlSection {
  /// Age after which a hit triggers a background refresh
  #[serde(default = "default_soft_ttl_ms")]
  pub soft_default_ms: u64,
  /// Age after which an entry is no longer served
  #[serde(default = "default_hard_ttl_ms")]
  pub hard_default_ms: u64,
  /// How long a caller waits on another worker's production
  #[serde(default = "default_render_timeout_ms")]
  pub render_timeout_ms: u64,
  #[serde(default = "default_lock_ttl_ms")]
  pub lock_ttl_ms: u64,
}
fn default_soft_ttl_ms() -> u64 {
  1000
}
fn default_hard_ttl_ms() -> u64 {
  1000
}
fn default_render_timeout_ms() -> u64 {
  5000
}
fn default_lock_ttl_ms() -> u64 {
  5000
}
impl Default for TtlSection {
  fn default() -> Self {
    Self {
      soft_default_ms: default_soft_ttl_ms(),
      hard_default_ms: default_hard_ttl_ms(),
      render_timeout_ms: default_render_timeout_ms(),
      lock_ttl_ms: default_lock_ttl_ms(),
    }
  }
}

impl TtlSection {
  pub fn coordinator_config(&self) -> CoordinatorConfig {
    CoordinatorConfig {
      lock_ttl: Duration::from_millis(self.lock_ttl_ms),
      max_wait: Duration::from_millis(self.render_timeout_ms),
      default_soft_ttl: Duration::from_millis(self.soft_default_ms),
      default_hard_ttl: Duration::from_millis(self.hard_default_ms),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
}
fn default_host() -> String {
  "0.0.0.0".into()
}
fn default_port() -> u16 {
  8090
}
impl Default for ServerSection {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Expected value of the `x-render-cache-api` header
  #[serde(default)]
  pub api_token: Option<String>,
}
fn default_true() -> bool {
  true
}
impl Default for AuthSection {
  fn default() -> Self {
    Self {
      enabled: true,
      api_token: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
  /// Interval of the expired-key purge
  #[serde(default = "default_expiration_interval_ms")]
  pub expiration_interval_ms: u64,
}
fn default_expiration_interval_ms() -> u64 {
  1000
}
impl Default for MemorySection {
  fn default() -> Self {
    Self {
      expiration_interval_ms: default_expiration_interval_ms(),
    }
  }
}

impl Config {
  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    Ok(serde_yaml::from_str(&expand_env_vars(content))?)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&content)
  }

  /// Load `tiercache.yaml` or `tiercache.yml` from `dir`, if present
  pub fn find_in(dir: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
    for name in ["tiercache.yaml", "tiercache.yml"] {
      let path = dir.as_ref().join(name);
      if path.exists() {
        tracing::info!("Loading config from {}", path.display());
        return Ok(Some(Self::from_file(&path)?));
      }
    }
    Ok(None)
  }

  pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
    Self::find_in(".")
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.server.host, self.server.port)
  }

  pub fn coordinator_config(&self) -> CoordinatorConfig {
    self.ttl.coordinator_config()
  }

  pub fn expiration_interval(&self) -> Duration {
    Duration::from_millis(self.memory.expiration_interval_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expand_env_vars() {
    std::env::set_var("TIERCACHE_TEST_HOST", "redis.internal");
    assert_eq!(
      expand_env_vars("redis://${TIERCACHE_TEST_HOST}:6379"),
      "redis://redis.internal:6379"
    );
    assert_eq!(
      expand_env_vars("$TIERCACHE_TEST_HOST/x"),
      "redis.internal/x"
    );
    assert_eq!(expand_env_vars("${TIERCACHE_TEST_UNSET_VAR}"), "");
    assert_eq!(expand_env_vars("cost: 5$"), "cost: 5$");
    assert_eq!(expand_env_vars("${OPEN"), "${OPEN");
  }

  #[test]
  fn test_coordinator_config_from_ttl() {
    let ttl = TtlSection {
      soft_default_ms: 250,
      hard_default_ms: 750,
      render_timeout_ms: 100,
      lock_ttl_ms: 300,
    };
    let config = ttl.coordinator_config();
    assert_eq!(config.default_soft_ttl, Duration::from_millis(250));
    assert_eq!(config.default_hard_ttl, Duration::from_millis(750));
    assert_eq!(config.max_wait, Duration::from_millis(100));
    assert_eq!(config.lock_ttl, Duration::from_millis(300));
  }
}
