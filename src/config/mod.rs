//! Configuration for the storage layer and its watch cache.
//!
//! Sources, later ones win:
//! 1. Type defaults
//! 2. File named by `CONFIG_PATH` (if set)
//! 3. Environment variables prefixed `STORAGE__`, `__` separated
//!
//! Loading never validates; call [`StorageConfig::validate`] once all
//! overrides are applied.

mod backend;
mod cacher;
mod retry;
mod store;
pub use backend::*;
pub use cacher::*;
pub use retry::*;
pub use store::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "STORAGE";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Typed KV store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Watch cache settings
    #[serde(default)]
    pub cacher: CacherConfig,
    /// External store adaptor settings
    #[serde(default)]
    pub backend: BackendConfig,
    /// Retry policies for background loops
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl StorageConfig {
    /// Loads defaults, then `CONFIG_PATH`, then `STORAGE__*` variables.
    ///
    /// ```ignore
    /// std::env::set_var("STORAGE__CACHER__WINDOW_CAPACITY", "500");
    /// let cfg = StorageConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layers `path` over the current values; environment still wins.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(self) -> Result<Self> {
        self.store.validate()?;
        self.cacher.validate()?;
        self.backend.validate()?;
        self.retry.validate()?;
        Ok(self)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
