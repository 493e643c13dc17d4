//! Sources of [`ProjectConfig`] snapshots and change notification.
use std::sync::Arc;

use tokio::sync::watch;

use crate::{project_config::ProjectConfig, Error, Result};

/// Receiving end of a configuration subscription. Holds the latest snapshot (`None` until the
/// first configuration is stored) and wakes up on every replacement.
pub type ConfigUpdates = watch::Receiver<Option<Arc<ProjectConfig>>>;

/// Supplies immutable configuration snapshots for one application.
pub trait ConfigSource: Send + Sync {
    /// Currently-active snapshot, or an error if none can be produced.
    fn get_config(&self) -> Result<Arc<ProjectConfig>>;

    /// Subscribe to configuration replacements.
    fn subscribe(&self) -> Result<ConfigUpdates> {
        Err(Error::UnsupportedOperation("subscribe"))
    }

    /// Release background resources. Further calls to `get_config` may keep returning the last
    /// snapshot.
    fn close(&self) {}
}

/// `ConfigurationStore` provides a thread-safe storage for the current configuration snapshot.
///
/// `ProjectConfig` itself is immutable and is only replaced completely, so readers always get a
/// consistent snapshot. Replacement notifies every subscriber.
pub struct ConfigurationStore {
    current: watch::Sender<Option<Arc<ProjectConfig>>>,
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        ConfigurationStore::new()
    }
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        ConfigurationStore { current }
    }

    /// Get currently-active configuration. Returns `None` if no configuration has been stored yet.
    pub fn get_configuration(&self) -> Option<Arc<ProjectConfig>> {
        self.current.borrow().clone()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(&self, config: Arc<ProjectConfig>) -> Option<Arc<ProjectConfig>> {
        log::debug!(target: "decision_agent", revision = config.revision(); "storing new configuration");
        self.current.send_replace(Some(config))
    }

    pub fn watch(&self) -> ConfigUpdates {
        self.current.subscribe()
    }
}

impl ConfigSource for ConfigurationStore {
    fn get_config(&self) -> Result<Arc<ProjectConfig>> {
        self.get_configuration()
            .ok_or(Error::ConfigurationNotFetched)
    }

    fn subscribe(&self) -> Result<ConfigUpdates> {
        Ok(self.watch())
    }
}

/// A source serving one fixed snapshot, e.g. a datafile bundled with the application.
pub struct StaticConfigSource {
    config: Arc<ProjectConfig>,
}

impl StaticConfigSource {
    pub fn new(config: Arc<ProjectConfig>) -> StaticConfigSource {
        StaticConfigSource { config }
    }

    pub fn from_datafile(bytes: &[u8]) -> Result<StaticConfigSource> {
        Ok(StaticConfigSource::new(Arc::new(
            ProjectConfig::from_datafile(bytes)?,
        )))
    }
}

impl ConfigSource for StaticConfigSource {
    fn get_config(&self) -> Result<Arc<ProjectConfig>> {
        Ok(self.config.clone())
    }
}
