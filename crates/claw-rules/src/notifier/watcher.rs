//! Keeps the notifier set in sync with discovered targets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::notifier::alertmanager::AlertManagerClient;
use crate::notifier::config::NotifierConfig;
use crate::notifier::discovery::{Discoverer, DnsDiscoverer, StaticDiscoverer};
use crate::notifier::Notifier;

/// Builds a notifier for an alerts endpoint URL.
pub type NotifierFactory = Arc<dyn Fn(&str, Duration) -> Result<Arc<dyn Notifier>> + Send + Sync>;

/// A live notifier with the metadata of the target it was built from.
#[derive(Debug, Clone)]
pub struct NotifierTarget {
    /// The notifier.
    pub notifier: Arc<dyn Notifier>,
    /// Discovery metadata.
    pub labels: BTreeMap<String, String>,
}

/// Resolves a [`NotifierConfig`] into notifiers and refreshes them.
pub struct ConfigWatcher {
    config: NotifierConfig,
    discoverers: Vec<Arc<dyn Discoverer>>,
    factory: NotifierFactory,
    targets: Arc<RwLock<Vec<NotifierTarget>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("config", &self.config)
            .field("targets", &self.targets.read().len())
            .finish_non_exhaustive()
    }
}

fn alertmanager_notifier(url: &str, timeout: Duration) -> Result<Arc<dyn Notifier>> {
    Ok(Arc::new(AlertManagerClient::new(url, timeout)?))
}

impl ConfigWatcher {
    /// Creates a watcher that builds Alertmanager clients.
    #[must_use]
    pub fn new(config: NotifierConfig) -> Self {
        Self::with_factory(config, Arc::new(alertmanager_notifier))
    }

    /// Creates a watcher with a custom notifier constructor.
    #[must_use]
    pub fn with_factory(config: NotifierConfig, factory: NotifierFactory) -> Self {
        let mut discoverers: Vec<Arc<dyn Discoverer>> = Vec::new();
        if !config.static_configs.is_empty() {
            discoverers.push(Arc::new(StaticDiscoverer::new(&config.static_configs)));
        }
        if !config.dns_sd_configs.is_empty() {
            discoverers.push(Arc::new(DnsDiscoverer::new(config.dns_sd_configs.clone())));
        }
        Self {
            config,
            discoverers,
            factory,
            targets: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Replaces the discovery sources.
    #[must_use]
    pub fn with_discoverers(mut self, discoverers: Vec<Arc<dyn Discoverer>>) -> Self {
        self.discoverers = discoverers;
        self
    }

    /// Returns the watched configuration.
    #[must_use]
    pub const fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Returns the current notifiers.
    #[must_use]
    pub fn targets(&self) -> Vec<NotifierTarget> {
        self.targets.read().clone()
    }

    /// Returns the current notifiers without metadata.
    #[must_use]
    pub fn notifiers(&self) -> Vec<Arc<dyn Notifier>> {
        self.targets
            .read()
            .iter()
            .map(|t| Arc::clone(&t.notifier))
            .collect()
    }

    /// Runs discovery once and reconciles the notifier set.
    ///
    /// Existing notifiers for unchanged URLs are kept; notifiers whose target
    /// vanished are closed.
    ///
    /// # Errors
    ///
    /// Returns an error if a discoverer fails or a notifier cannot be built.
    /// The previous set is left untouched in that case.
    pub async fn refresh(&self) -> Result<usize> {
        refresh(
            &self.config,
            &self.discoverers,
            &self.factory,
            &self.targets,
        )
        .await
    }

    /// Starts periodic refresh if any source needs it.
    pub fn start(&self) {
        if !self.config.needs_refresh() {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let config = self.config.clone();
        let discoverers = self.discoverers.clone();
        let factory = Arc::clone(&self.factory);
        let targets = Arc::clone(&self.targets);
        let cancel = self.cancel.clone();
        let period = self.config.refresh_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = refresh(&config, &discoverers, &factory, &targets).await {
                            warn!(error = %e, "notifier discovery refresh failed");
                        }
                    }
                }
            }
            debug!("notifier watcher stopped");
        }));
    }

    /// Stops periodic refresh and closes all notifiers.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "notifier watcher task failed");
            }
        }
        let targets = std::mem::take(&mut *self.targets.write());
        for t in targets {
            t.notifier.close();
        }
    }
}

async fn refresh(
    config: &NotifierConfig,
    discoverers: &[Arc<dyn Discoverer>],
    factory: &NotifierFactory,
    targets: &RwLock<Vec<NotifierTarget>>,
) -> Result<usize> {
    let mut discovered = Vec::new();
    for d in discoverers {
        discovered.extend(d.discover().await?);
    }

    let current: HashMap<String, NotifierTarget> = targets
        .read()
        .iter()
        .map(|t| (t.notifier.addr().to_string(), t.clone()))
        .collect();

    let mut next: Vec<NotifierTarget> = Vec::with_capacity(discovered.len());
    let mut seen = std::collections::HashSet::new();
    for target in discovered {
        let url = config.target_url(&target.address)?;
        if !seen.insert(url.clone()) {
            continue;
        }
        let notifier = match current.get(&url) {
            Some(existing) => Arc::clone(&existing.notifier),
            None => factory(&url, config.timeout)?,
        };
        next.push(NotifierTarget {
            notifier,
            labels: target.labels,
        });
    }

    let stale: Vec<NotifierTarget> = current
        .into_values()
        .filter(|t| !seen.contains(t.notifier.addr()))
        .collect();
    let count = next.len();
    *targets.write() = next;

    for t in &stale {
        info!(addr = %t.notifier.addr(), "notifier target removed");
        t.notifier.close();
    }
    debug!(targets = count, removed = stale.len(), "notifier targets refreshed");
    Ok(count)
}
