//! Process-wide notifier set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{Result, RuleError};
use crate::notifier::alertmanager::AlertManagerClient;
use crate::notifier::config::NotifierConfig;
use crate::notifier::watcher::{ConfigWatcher, NotifierFactory};
use crate::notifier::Notifier;

/// Holds every notifier the process delivers alerts to.
///
/// Notifiers come either from a fixed URL list or from a configuration file
/// whose targets are refreshed in the background. The registry is created
/// once at startup and handed to the manager.
pub struct NotifierRegistry {
    fixed: Vec<Arc<dyn Notifier>>,
    config_path: Option<PathBuf>,
    factory: Option<NotifierFactory>,
    watcher: RwLock<Option<Arc<ConfigWatcher>>>,
    reload_permit: Semaphore,
}

impl std::fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("fixed", &self.fixed)
            .field("config_path", &self.config_path)
            .field("watcher", &self.watcher.read())
            .finish_non_exhaustive()
    }
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        Self::with_notifiers(Vec::new())
    }
}

impl NotifierRegistry {
    /// Creates a registry from already built notifiers.
    #[must_use]
    pub fn with_notifiers(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            fixed: notifiers,
            config_path: None,
            factory: None,
            watcher: RwLock::new(None),
            reload_permit: Semaphore::new(1),
        }
    }

    /// Creates Alertmanager clients for full alerts endpoint URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if a client cannot be built.
    pub fn from_urls(urls: &[String], timeout: Duration) -> Result<Self> {
        let notifiers = urls
            .iter()
            .map(|u| {
                url::Url::parse(u).map_err(|e| RuleError::InvalidConfig {
                    reason: format!("invalid notifier url {u:?}: {e}"),
                })?;
                Ok(Arc::new(AlertManagerClient::new(u.clone(), timeout)?) as Arc<dyn Notifier>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_notifiers(notifiers))
    }

    /// Loads notifier targets from a configuration file and starts refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is invalid or initial discovery fails.
    pub async fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build_from_file(path.as_ref(), None).await
    }

    /// Like [`from_config_file`](Self::from_config_file) with a custom
    /// notifier constructor.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is invalid or initial discovery fails.
    pub async fn from_config_file_with_factory(
        path: impl AsRef<Path>,
        factory: NotifierFactory,
    ) -> Result<Self> {
        Self::build_from_file(path.as_ref(), Some(factory)).await
    }

    async fn build_from_file(path: &Path, factory: Option<NotifierFactory>) -> Result<Self> {
        let watcher = start_watcher(path, factory.as_ref()).await?;
        Ok(Self {
            fixed: Vec::new(),
            config_path: Some(path.to_path_buf()),
            factory,
            watcher: RwLock::new(Some(Arc::new(watcher))),
            reload_permit: Semaphore::new(1),
        })
    }

    /// Returns a snapshot of the current notifiers.
    #[must_use]
    pub fn notifiers(&self) -> Vec<Arc<dyn Notifier>> {
        let mut out = self.fixed.clone();
        if let Some(w) = self.watcher.read().as_ref() {
            out.extend(w.notifiers());
        }
        out
    }

    /// Returns `true` if any notifier source was configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.fixed.is_empty() || self.config_path.is_some()
    }

    /// Re-reads the configuration file.
    ///
    /// Concurrent calls collapse: if a reload is already running this returns
    /// `Ok(false)` immediately. On error the previous notifiers stay active.
    ///
    /// # Errors
    ///
    /// Returns an error if the new configuration is invalid.
    pub async fn reload(&self) -> Result<bool> {
        let Ok(_permit) = self.reload_permit.try_acquire() else {
            return Ok(false);
        };
        let Some(path) = &self.config_path else {
            return Ok(true);
        };

        let next = match start_watcher(path, self.factory.as_ref()).await {
            Ok(w) => Arc::new(w),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "notifier config reload failed");
                return Err(e);
            }
        };
        let previous = self.watcher.write().replace(next);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!(path = %path.display(), targets = self.notifiers().len(), "notifier config reloaded");
        Ok(true)
    }

    /// Stops background refresh and closes every notifier.
    pub async fn close(&self) {
        let watcher = self.watcher.write().take();
        if let Some(w) = watcher {
            w.stop().await;
        }
        for n in &self.fixed {
            n.close();
        }
    }
}

async fn start_watcher(path: &Path, factory: Option<&NotifierFactory>) -> Result<ConfigWatcher> {
    let config = NotifierConfig::load(path)?;
    let watcher = match factory {
        Some(f) => ConfigWatcher::with_factory(config, Arc::clone(f)),
        None => ConfigWatcher::new(config),
    };
    watcher.refresh().await?;
    watcher.start();
    Ok(watcher)
}
