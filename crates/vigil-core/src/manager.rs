//! Management façade over the core: configuration reloads and status.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, ConfigFormat, ExperimentsConfig, ServicesConfig};
use crate::core::{Core, CoreError};
use crate::status::{unix_seconds, StatusReport};

/// Services-config location and formats.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Format of the services configuration file.
    pub format: ConfigFormat,
    /// Path to the services configuration file.
    pub path: PathBuf,
    /// Where the normalized configuration is dumped after a successful
    /// reload. No dump is written when unset.
    pub dump_path: Option<PathBuf>,
}

/// A reload failure, labeled with the stage that failed. The previous
/// core state stays in effect.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to load services config: {0}")]
    Load(#[source] ConfigError),

    #[error("failed to prepare services config: {0}")]
    Prepare(#[source] ConfigError),

    #[error("failed to process reload: {0}")]
    Reload(#[from] CoreError),

    #[error("failed to dump services config: {0}")]
    Dump(#[source] std::io::Error),
}

/// Drives the core on behalf of the management surface: loads, validates
/// and applies service configurations, and reports status snapshots.
pub struct Manager {
    config: ManagerConfig,
    experiments: ExperimentsConfig,
    core: Arc<Core>,
    update_ts: Mutex<Option<SystemTime>>,
}

impl Manager {
    pub fn new(config: ManagerConfig, experiments: ExperimentsConfig, core: Arc<Core>) -> Self {
        Manager {
            config,
            experiments,
            core,
            update_ts: Mutex::new(None),
        }
    }

    /// Loads the services config from the configured path, validates it,
    /// applies it to the core, and dumps the normalized form.
    pub async fn reload(&self) -> Result<(), ManagerError> {
        info!(path = %self.config.path.display(), "starting services configuration reload");

        let mut config = ServicesConfig::load(&self.config.path, self.config.format)
            .map_err(ManagerError::Load)?;
        config
            .prepare(&self.experiments)
            .map_err(ManagerError::Prepare)?;

        self.core.reload(&config).await?;

        *self.update_ts.lock().expect("manager state poisoned") = Some(SystemTime::now());

        if let Some(dump_path) = &self.config.dump_path {
            config.dump(dump_path).map_err(ManagerError::Dump)?;
        }

        info!("services configuration reload finished");
        Ok(())
    }

    /// Status of every service plus the last successful reload timestamp.
    pub async fn status(&self) -> StatusReport {
        let update_ts = *self.update_ts.lock().expect("manager state poisoned");
        StatusReport {
            update_timestamp: update_ts.map(unix_seconds),
            services: self.core.status().await,
        }
    }
}
