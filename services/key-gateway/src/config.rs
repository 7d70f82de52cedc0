//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials are never stored in the TOML directly: each pool names an
//! env var holding a comma-separated list (e.g. `GROQ_API_KEY_RAG`) and/or a
//! `keys_file`. The env var wins when both are present.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::{HealthPolicy, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub pools: Vec<PoolConfig>,
}

/// Listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Operator-only listener for key statistics. Never expose publicly.
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential health thresholds
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

/// Executor retry settings
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

/// One named credential pool
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Env var holding a comma-separated credential list
    #[serde(default)]
    pub env: Option<String>,
    /// File holding credentials separated by commas or newlines
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub credentials: Vec<Secret<String>>,
}

fn default_admin_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_error_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            error_threshold: self.error_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then resolve pool credentials.
    ///
    /// Credential resolution order per pool:
    /// 1. the env var named by `env`
    /// 2. `keys_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        for pool in &mut config.pools {
            pool.credentials = pool.resolve_credentials()?;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.server.upstream_url.starts_with("http://")
            && !self.server.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.server.upstream_url
            )));
        }

        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.health.error_threshold == 0 {
            return Err(common::Error::Config(
                "error_threshold must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.pools.is_empty() {
            return Err(common::Error::Config(
                "at least one [[pools]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                return Err(common::Error::Config("pool name must not be empty".into()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate pool name: {}",
                    pool.name
                )));
            }
            if pool.env.is_none() && pool.keys_file.is_none() {
                return Err(common::Error::Config(format!(
                    "pool {} needs an env var or keys_file",
                    pool.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-gateway.toml")
    }
}

impl PoolConfig {
    fn resolve_credentials(&self) -> common::Result<Vec<Secret<String>>> {
        let from_env = self.env.as_deref().and_then(|var| std::env::var(var).ok());

        let raw = match (from_env, &self.keys_file) {
            (Some(value), _) => value,
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                common::Error::Credentials(format!(
                    "failed to read keys_file {} for pool {}: {e}",
                    path.display(),
                    self.name
                ))
            })?,
            (None, None) => String::new(),
        };

        let credentials = parse_credentials(&raw);
        if credentials.is_empty() {
            return Err(common::Error::Credentials(format!(
                "pool {} has no credentials (env: {}, keys_file: {})",
                self.name,
                self.env.as_deref().unwrap_or("-"),
                self.keys_file
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into())
            )));
        }
        Ok(credentials)
    }
}

/// Split a credential list on commas and newlines, trimming blanks and
/// dropping duplicates while keeping first-seen order.
pub fn parse_credentials(raw: &str) -> Vec<Secret<String>> {
    let mut seen = HashSet::new();
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|c| !c.is_empty() && seen.insert(*c))
        .map(|c| Secret::new(c.to_owned()))
        .collect()
}
