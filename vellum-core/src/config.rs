//! Cache configuration

use crate::{ConfigError, CORE_TABLE_COUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the vellum root directory.
pub const ROOT_ENV: &str = "VELLUM_ROOT";
/// Environment variable naming the active profile.
pub const PROFILE_ENV: &str = "VELLUM_PROFILE";
/// Environment variable overriding the LMDB map size (in megabytes).
pub const MAP_SIZE_ENV: &str = "VELLUM_CACHE_MAP_SIZE_MB";

const DEFAULT_PROFILE: &str = "default";
const DEFAULT_MAP_SIZE_MB: usize = 1024;
const DEFAULT_MAX_DBS: u32 = 16;

fn default_map_size_mb() -> usize {
    DEFAULT_MAP_SIZE_MB
}

fn default_max_dbs() -> u32 {
    DEFAULT_MAX_DBS
}

/// Configuration for opening a versioned cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,
    /// Maximum size of the memory map in megabytes.
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
    /// Maximum number of named tables (core tables plus extension tables).
    #[serde(default = "default_max_dbs")]
    pub max_dbs: u32,
}

impl CacheConfig {
    /// Create a config for the given directory with default sizing.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
            max_dbs: DEFAULT_MAX_DBS,
        }
    }

    /// Config for a named profile under a vellum root: `<root>/caches/<profile>`.
    pub fn for_profile(root: impl AsRef<Path>, profile: &str) -> Self {
        Self::new(root.as_ref().join("caches").join(profile))
    }

    /// Build a config from `VELLUM_ROOT`, `VELLUM_PROFILE` and
    /// `VELLUM_CACHE_MAP_SIZE_MB`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CacheConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = lookup(ROOT_ENV)
            .filter(|root| !root.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                field: ROOT_ENV.to_string(),
            })?;
        let profile = lookup(PROFILE_ENV).unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let mut config = Self::for_profile(root, &profile);
        if let Some(raw) = lookup(MAP_SIZE_ENV) {
            let size = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| ConfigError::InvalidValue {
                    field: MAP_SIZE_ENV.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
            config = config.with_map_size_mb(size);
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the map size in megabytes.
    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    /// Set the maximum number of named tables.
    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Map size in bytes, as LMDB expects it.
    pub fn map_size_bytes(&self) -> usize {
        self.map_size_mb.saturating_mul(1024 * 1024)
    }

    /// Reject sizing that cannot hold the core schema plus one extension.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "map size must be positive".to_string(),
            });
        }
        let min_dbs = CORE_TABLE_COUNT as u32 + 1;
        if self.max_dbs < min_dbs {
            return Err(ConfigError::InvalidValue {
                field: "max_dbs".to_string(),
                value: self.max_dbs.to_string(),
                reason: format!("at least {min_dbs} tables are required"),
            });
        }
        Ok(())
    }
}
