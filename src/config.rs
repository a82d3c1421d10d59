use crate::error::QuotaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store path that selects a private in-memory SQLite database.
pub const IN_MEMORY_STORE: &str = ":memory:";

/// Runtime configuration for a quota engine.
///
/// Every section defaults independently, so a TOML file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuotaConfig {
    pub cell: CellQuotaConfig,
    pub actor: ActorQuotaConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub permissions: PermissionConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellQuotaConfig {
    pub enabled: bool,
    pub max_per_cell: i32,
    /// Recount the cell from the live inventory on every lookup.
    pub verify_on_check: bool,
}

impl Default for CellQuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_cell: 1000,
            verify_on_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorQuotaConfig {
    pub enabled: bool,
    /// Ceiling for actors without a higher tier grant.
    pub max_per_actor: i32,
    /// Permissions of the form `<tier_prefix><n>` grant a ceiling of `n`.
    pub tier_prefix: String,
    /// Named permissions with a fixed ceiling, on top of the numeric tiers.
    pub tiers: Vec<TierRuleConfig>,
}

impl Default for ActorQuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_actor: 500,
            tier_prefix: "spawnquota.peractor.".to_string(),
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRuleConfig {
    pub permission: String,
    pub ceiling: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            sweep_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spawner_limits.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(IN_MEMORY_STORE),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_STORE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub bypass_cell: String,
    pub bypass_actor: String,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            bypass_cell: "spawnquota.bypass".to_string(),
            bypass_actor: "spawnquota.peractor.bypass".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Defaults to the available parallelism, never fewer than 2.
    pub region_workers: usize,
    /// A region spans `2^region_shift` cells on each side.
    pub region_shift: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            region_workers: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            region_shift: 3,
        }
    }
}

impl DispatchConfig {
    /// Largest accepted `region_shift`.
    pub const MAX_REGION_SHIFT: u32 = 16;

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.region_workers == 0 {
            return Err(invalid("dispatch.region_workers must be greater than zero"));
        }
        if self.region_shift > Self::MAX_REGION_SHIFT {
            return Err(invalid("dispatch.region_shift must be at most 16"));
        }
        Ok(())
    }
}

impl QuotaConfig {
    /// In-memory store and short cache lifetimes, for tests and local runs.
    pub fn development() -> Self {
        Self {
            store: StoreConfig::in_memory(),
            cache: CacheConfig {
                enabled: true,
                ttl_seconds: 30,
                sweep_interval_seconds: 30,
            },
            dispatch: DispatchConfig {
                region_workers: 2,
                region_shift: 3,
            },
            ..Self::default()
        }
    }

    pub fn production(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                path: store_path.into(),
                ..StoreConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, QuotaError> {
        let config: QuotaConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, QuotaError> {
        let contents = fs::read_to_string(path).map_err(|e| QuotaError::InvalidConfig {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.cell.max_per_cell < 0 {
            return Err(invalid("cell.max_per_cell must not be negative"));
        }
        if self.actor.max_per_actor < 0 {
            return Err(invalid("actor.max_per_actor must not be negative"));
        }
        if self.actor.tier_prefix.is_empty() {
            return Err(invalid("actor.tier_prefix must not be empty"));
        }
        if let Some(rule) = self.actor.tiers.iter().find(|t| t.ceiling < 0) {
            return Err(invalid(&format!(
                "tier '{}' has a negative ceiling",
                rule.permission
            )));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(invalid("cache.ttl_seconds must be greater than zero"));
        }
        if self.cache.sweep_interval_seconds == 0 {
            return Err(invalid(
                "cache.sweep_interval_seconds must be greater than zero",
            ));
        }
        self.dispatch.validate()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_seconds)
    }
}

fn invalid(message: &str) -> QuotaError {
    QuotaError::InvalidConfig {
        message: message.to_string(),
    }
}
