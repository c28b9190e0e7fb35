//! Local warehouse workspace: engine config plus a snapshot file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use strata_core::{EngineConfig, MemoryWarehouse};
use strata_merge::MergeEngine;

use crate::Config;

/// An engine over the warehouse snapshot named by the CLI config.
pub struct Workspace {
    /// The loaded warehouse.
    pub store: Arc<MemoryWarehouse>,
    /// Engine bound to `store`.
    pub engine: MergeEngine,
    state_path: PathBuf,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Loads the engine config and the warehouse snapshot.
    ///
    /// A missing snapshot file yields an empty warehouse.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is unreadable or invalid, or the
    /// snapshot cannot be parsed.
    pub fn open(config: &Config) -> Result<Self> {
        let mut engine_config = EngineConfig::from_path(&config.config_path)
            .with_context(|| format!("loading {}", config.config_path.display()))?;
        engine_config
            .apply_env()
            .context("applying STRATA_* overrides")?;

        let store = Arc::new(
            MemoryWarehouse::load(&config.state_path)
                .with_context(|| format!("loading {}", config.state_path.display()))?,
        );
        let engine = MergeEngine::new(store.clone(), engine_config)?;
        tracing::debug!(state = %config.state_path.display(), "workspace opened");
        Ok(Self {
            store,
            engine,
            state_path: config.state_path.clone(),
        })
    }

    /// Writes the warehouse back to the snapshot file.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save(&self) -> Result<()> {
        self.store
            .save(&self.state_path)
            .with_context(|| format!("saving {}", self.state_path.display()))
    }
}
