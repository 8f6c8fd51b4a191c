use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resilience::{BackoffSchedule, LimitPolicy, RateLimiter};

/// Configuration for marquee.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. Environment variables (MARQUEE_* prefix)
/// 2. Config file (~/.config/marquee/config.toml)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite database holding the run ledger.
    ///
    /// Can be set via:
    /// - ENV: MARQUEE_DATABASE_PATH
    /// - Config: database_path = "/path/to/db"
    /// - Default: ~/.local/share/marquee/marquee.db
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,

    /// Provider settings, keyed by provider name (`[providers.tmdb]`).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default file and environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `config_path` (if it exists) and environment
    /// variables with the MARQUEE_ prefix.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        let env_opts = env::Options::with_top_level("marquee");
        builder
            .add_env(env_opts)
            .context("Failed to load environment variables")?;

        let config: Self = builder.build().context("Failed to build configuration")?;
        Ok(config)
    }

    /// Look up a provider section by name.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .with_context(|| format!("No [providers.{name}] section in configuration"))
    }
}

/// Settings for one external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL; request path segments are appended to it.
    pub base_url: String,

    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Query parameters added to every request unless the caller sets them
    /// (typically the API key).
    #[serde(default)]
    pub default_query: BTreeMap<String, String>,

    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    /// Enables the response cache when present.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            default_query: BTreeMap::new(),
            default_headers: BTreeMap::new(),
            cache: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per request, the first one included.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay list; the last entry repeats. Overrides `base_delay_ms`.
    #[serde(default)]
    pub delays_ms: Option<Vec<u64>>,

    /// Base of the linear schedule (`attempt * base`).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delays_ms: None,
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn schedule(&self) -> BackoffSchedule {
        match &self.delays_ms {
            Some(delays) if !delays.is_empty() => {
                BackoffSchedule::Fixed(delays.iter().copied().map(Duration::from_millis).collect())
            }
            _ => BackoffSchedule::Linear(Duration::from_millis(self.base_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Block,
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window.
    #[serde(default = "default_ceiling")]
    pub ceiling: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default)]
    pub policy: PolicyKind,

    /// Longest a blocked call waits before failing.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            window_secs: default_window_secs(),
            policy: PolicyKind::default(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self) -> LimitPolicy {
        match self.policy {
            PolicyKind::FailFast => LimitPolicy::FailFast,
            PolicyKind::Block => LimitPolicy::Block {
                max_wait: Duration::from_secs(self.max_wait_secs),
            },
        }
    }

    /// Build a limiter with its own in-memory window store.
    ///
    /// Share the returned limiter (it is cheap to clone) between every
    /// client that uses the same credential.
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.ceiling,
            Duration::from_secs(self.window_secs),
            self.policy(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Defaults to the provider name.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_ceiling() -> u32 {
    40
}

fn default_window_secs() -> u64 {
    10
}

fn default_max_wait_secs() -> u64 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    300
}

/// Returns: ~/.local/share/marquee/marquee.db (or platform equivalent)
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marquee")
        .join("marquee.db")
}

/// Get the config file path.
///
/// Returns:
/// - Linux: ~/.config/marquee/config.toml
/// - macOS: ~/Library/Application Support/marquee/config.toml
/// - Windows: %APPDATA%\marquee\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marquee")
        .join("config.toml")
}

/// Get the example config file content.
pub fn example_config() -> &'static str {
    r#"# Marquee Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. Environment variables (MARQUEE_* prefix)
# 2. This config file
# 3. Built-in defaults (lowest priority)

# Path to the SQLite database holding the ingestion run ledger
#
# Can also be set via:
# - Environment: MARQUEE_DATABASE_PATH=/custom/path.db
#
# Default: Platform-specific data directory
#database_path = "/path/to/custom/marquee.db"

# One section per provider. The section name is the limiter key.
[providers.tmdb]
base_url = "https://api.themoviedb.org/3"
timeout_secs = 30

# Added to every request unless the caller passes its own value
[providers.tmdb.default_query]
api_key = "your-tmdb-api-key-here"

[providers.tmdb.default_headers]
accept = "application/json"

# attempts counts the first call. Use delays_ms for a fixed schedule;
# otherwise delays grow linearly: attempt * base_delay_ms.
[providers.tmdb.retry]
attempts = 3
base_delay_ms = 500
#delays_ms = [250, 1000, 4000]

# policy = "block" waits up to max_wait_secs for the window to reset;
# policy = "fail_fast" returns a rate-limit error immediately.
[providers.tmdb.rate_limit]
ceiling = 40
window_secs = 10
policy = "block"
max_wait_secs = 60

# Uncomment to memoize successful GET responses
#[providers.tmdb.cache]
#namespace = "tmdb"
#ttl_secs = 300
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    write_example_config(&config_file_path())
}

/// Write [`example_config`] to `config_path` unless a file is already there.
///
/// Returns true if a new file was created.
pub fn write_example_config(config_path: &Path) -> Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}
