//! Engine configuration with profile support.
//!
//! Profiles (`default`, `testing`, `production`) are selected with
//! `LENDSYNC_PROFILE`; `LENDSYNC_CONFIG` points at a TOML file instead.
//! The resulting value is passed explicitly to whatever needs it.

use crate::amount::{Amount, WAD};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const PROFILE_ENV: &str = "LENDSYNC_PROFILE";
pub const CONFIG_PATH_ENV: &str = "LENDSYNC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fixed-point scale of ledger ratios, as a decimal string
    #[serde(default = "default_scale")]
    pub scale: Amount,
}

fn default_scale() -> Amount {
    Amount::new(WAD)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Re-read/re-apply attempts when a position update hits a version conflict
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
}

fn default_max_update_attempts() -> u32 {
    3
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: default_max_update_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between reconciliation passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Pending transactions examined per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Pending rows older than this are reported as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Unmined rows older than this are given up on and marked Failed
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,

    /// Receipt lookups in flight at once
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,

    /// Backfill attempts before an entry is dropped
    #[serde(default = "default_max_backfill_attempts")]
    pub max_backfill_attempts: u32,
}

fn default_interval_secs() -> u64 {
    15
}
fn default_batch_size() -> i64 {
    100
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_abandon_after_secs() -> u64 {
    3_600
}
fn default_max_concurrent_lookups() -> usize {
    8
}
fn default_max_backfill_attempts() -> u32 {
    10
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            stale_after_secs: default_stale_after_secs(),
            abandon_after_secs: default_abandon_after_secs(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            max_backfill_attempts: default_max_backfill_attempts(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_after_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Postgres
}
fn default_max_connections() -> u32 {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            risk: RiskConfig::default(),
            mirror: MirrorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// In-memory store, fast polling.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            risk: RiskConfig::default(),
            mirror: MirrorConfig {
                max_update_attempts: 5,
            },
            reconciler: ReconcilerConfig {
                interval_secs: 2,
                batch_size: 20,
                stale_after_secs: 60,
                abandon_after_secs: 300,
                max_concurrent_lookups: 4,
                max_backfill_attempts: 3,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                max_connections: 2,
                acquire_timeout_secs: 2,
            },
        }
    }

    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            risk: RiskConfig::default(),
            mirror: MirrorConfig {
                max_update_attempts: 5,
            },
            reconciler: ReconcilerConfig {
                interval_secs: 10,
                batch_size: 500,
                stale_after_secs: 900,
                abandon_after_secs: 7_200,
                max_concurrent_lookups: 16,
                max_backfill_attempts: 20,
            },
            store: StoreConfig {
                backend: StoreBackend::Postgres,
                max_connections: 25,
                acquire_timeout_secs: 5,
            },
        }
    }

    pub fn from_profile(profile: &str) -> Self {
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// `LENDSYNC_CONFIG` file if set, otherwise the `LENDSYNC_PROFILE` profile.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(path);
        }
        let profile = std::env::var(PROFILE_ENV).unwrap_or_else(|_| "default".to_string());
        let config = Self::from_profile(&profile);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.scale.is_zero() {
            return Err(ConfigError::Invalid("risk.scale must be positive".into()));
        }
        if self.mirror.max_update_attempts == 0 {
            return Err(ConfigError::Invalid("mirror.max_update_attempts must be at least 1".into()));
        }
        if self.reconciler.batch_size <= 0 {
            return Err(ConfigError::Invalid("reconciler.batch_size must be positive".into()));
        }
        if self.reconciler.interval_secs == 0 {
            return Err(ConfigError::Invalid("reconciler.interval_secs must be positive".into()));
        }
        if self.reconciler.abandon_after_secs < self.reconciler.stale_after_secs {
            return Err(ConfigError::Invalid(
                "reconciler.abandon_after_secs must not be below stale_after_secs".into(),
            ));
        }
        if self.reconciler.max_backfill_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.max_backfill_attempts must be at least 1".into(),
            ));
        }
        if self.reconciler.max_concurrent_lookups == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.max_concurrent_lookups must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            scale = %self.risk.scale,
            max_update_attempts = self.mirror.max_update_attempts,
            "Risk and mirror settings"
        );
        tracing::info!(
            interval_secs = self.reconciler.interval_secs,
            batch_size = self.reconciler.batch_size,
            stale_after_secs = self.reconciler.stale_after_secs,
            abandon_after_secs = self.reconciler.abandon_after_secs,
            max_backfill_attempts = self.reconciler.max_backfill_attempts,
            "Reconciler settings"
        );
        tracing::info!(
            backend = ?self.store.backend,
            max_connections = self.store.max_connections,
            "Store settings"
        );
    }
}
