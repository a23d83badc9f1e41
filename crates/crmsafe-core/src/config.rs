use crate::error::{CrmError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RateLimitConfig
// ---------------------------------------------------------------------------

/// Token-bucket sizing for outbound remote calls.
///
/// The defaults match the remote service's published burst limit of 100
/// requests per 10 seconds, with at most 10 requests in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_max_tokens() -> u32 {
    100
}

fn default_refill_interval_ms() -> u64 {
    10_000
}

fn default_max_concurrent() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_interval_ms: default_refill_interval_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Reject sizings the limiter cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(CrmError::InvalidConfig(
                "rate_limit.max_tokens must be greater than 0".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(CrmError::InvalidConfig(
                "rate_limit.max_concurrent must be greater than 0".into(),
            ));
        }
        if self.max_concurrent > self.max_tokens {
            return Err(CrmError::InvalidConfig(format!(
                "rate_limit.max_concurrent ({}) must not exceed max_tokens ({})",
                self.max_concurrent, self.max_tokens
            )));
        }
        if self.refill_interval_ms == 0 {
            return Err(CrmError::InvalidConfig(
                "rate_limit.refill_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LockConfig / CacheConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
}

fn default_expiry_minutes() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_minutes: default_expiry_minutes(),
        }
    }
}

impl LockConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_minutes * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

// ---------------------------------------------------------------------------
// FailurePolicy / ExecutionConfig
// ---------------------------------------------------------------------------

/// What the executor does after an action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep going with actions that do not depend on the failed one.
    #[default]
    Continue,
    /// Stop at the first failure; remaining actions stay `pending`.
    Abort,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Continue => "continue",
            FailurePolicy::Abort => "abort",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub skip_unconfirmed: bool,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub portal_id: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

fn default_api_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_REPORTS_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            portal_id: String::new(),
            api_base_url: default_api_base_url(),
            reports_dir: default_reports_dir(),
            rate_limit: RateLimitConfig::default(),
            lock: LockConfig::default(),
            cache: CacheConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CrmError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Like [`Config::load`], but a missing config file yields the defaults.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Err(CrmError::NotInitialized) => Ok(Self::default()),
            other => other,
        }
    }

    /// The reports directory resolved against `root`.
    pub fn reports_path(&self, root: &Path) -> PathBuf {
        paths::reports_dir(root, &self.reports_dir)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if let Err(e) = self.rate_limit.validate() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            });
        }

        if self.lock.expiry_minutes == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "lock.expiry_minutes must be greater than 0".into(),
            });
        }

        if self.portal_id.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "portal_id is empty; pass --portal or set CRMSAFE_PORTAL".into(),
            });
        }

        if !self.api_base_url.starts_with("https://") {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "api_base_url '{}' is not https; the API token will be sent in clear text",
                    self.api_base_url
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
