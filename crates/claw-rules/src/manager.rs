//! Reconciliation of running groups against configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::GroupConfig;
use crate::error::{Result, RuleError};
use crate::group::{DEFAULT_INTERVAL, Executor, Group, RestoreConfig};
use crate::hash::RuleKind;
use crate::rule::Rule;
use crate::template::{DefaultRenderer, TemplateRenderer};
use crate::types::Alert;

/// Owns every running [`Group`].
///
/// [`update`](Manager::update) diffs a freshly loaded configuration against
/// the running set by group ID: removed groups are closed, new groups are
/// started, and groups whose checksum changed are patched in place so that
/// alert state of unchanged rules survives a reload.
#[derive(Debug)]
pub struct Manager {
    executor: Arc<Executor>,
    restore: Option<RestoreConfig>,
    renderer: Arc<dyn TemplateRenderer>,
    default_interval: Duration,
    groups: RwLock<HashMap<u64, Arc<Group>>>,
}

impl Manager {
    /// Creates a manager dispatching through `executor`.
    #[must_use]
    pub fn new(executor: Executor) -> Self {
        Self {
            executor: Arc::new(executor),
            restore: None,
            renderer: Arc::new(DefaultRenderer::new()),
            default_interval: DEFAULT_INTERVAL,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the datasource used to restore alert state of new groups.
    #[must_use]
    pub fn with_restore(mut self, restore: RestoreConfig) -> Self {
        self.restore = Some(restore);
        self
    }

    /// Sets the template renderer for alert labels and annotations.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Sets the interval of groups that do not define one.
    ///
    /// A zero interval keeps [`DEFAULT_INTERVAL`].
    #[must_use]
    pub const fn with_default_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.default_interval = interval;
        }
        self
    }

    /// Returns the executor shared by all groups.
    #[must_use]
    pub const fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Starts the initial set of groups, restoring alert state.
    ///
    /// # Errors
    ///
    /// See [`update`](Self::update).
    pub async fn start(&self, configs: Vec<GroupConfig>) -> Result<()> {
        self.update(configs, true).await
    }

    /// Applies a new configuration.
    ///
    /// When `restore` is set, newly added groups restore alert state before
    /// their first evaluation.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidConfig` if recording rules are configured
    /// without remote write or alerting rules without notifiers. Nothing is
    /// started or changed in that case.
    pub async fn update(&self, configs: Vec<GroupConfig>, restore: bool) -> Result<()> {
        self.check_collaborators(&configs)?;

        let mut incoming: HashMap<u64, GroupConfig> = HashMap::with_capacity(configs.len());
        for cfg in configs {
            let id = cfg.id();
            if let Some(prev) = incoming.insert(id, cfg) {
                return Err(RuleError::InvalidConfig {
                    reason: format!("group {:?} in {:?} defined twice", prev.name, prev.file),
                });
            }
        }

        let restore = if restore { self.restore.clone() } else { None };
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        let mut added = 0;
        {
            let mut groups = self.groups.write();
            groups.retain(|id, g| {
                if incoming.contains_key(id) {
                    return true;
                }
                removed.push(Arc::clone(g));
                false
            });

            for (id, cfg) in incoming {
                let new_group = Group::new(&cfg, self.default_interval, &self.renderer);
                match groups.get(&id) {
                    Some(running) if running.checksum() != cfg.checksum => {
                        changed.push((Arc::clone(running), new_group));
                    }
                    Some(_) => {}
                    None => {
                        let group = Arc::new(new_group);
                        group.start(Arc::clone(&self.executor), restore.clone());
                        groups.insert(id, group);
                        added += 1;
                    }
                }
            }
        }

        let removed_count = removed.len();
        let changed_count = changed.len();
        join_all(removed.iter().map(|g| g.close())).await;
        for g in &removed {
            self.executor.retain_rules(g.id(), &HashSet::new());
        }
        let executor = &self.executor;
        join_all(changed.into_iter().map(|(g, new)| async move {
            g.update_with(new).await;
            let rule_ids: HashSet<u64> = g.rules().iter().map(|r| r.id()).collect();
            executor.retain_rules(g.id(), &rule_ids);
        }))
        .await;

        info!(
            added,
            removed = removed_count,
            changed = changed_count,
            "rules configuration applied"
        );
        Ok(())
    }

    fn check_collaborators(&self, configs: &[GroupConfig]) -> Result<()> {
        let kinds = || configs.iter().flat_map(|g| g.rules.iter().map(|r| r.kind()));
        if !self.executor.has_remote_write() && kinds().any(|k| k == RuleKind::Recording) {
            return Err(RuleError::InvalidConfig {
                reason: "config contains recording rules but remote write is not configured"
                    .to_string(),
            });
        }
        if !self.executor.notifiers().is_configured() && kinds().any(|k| k == RuleKind::Alerting) {
            return Err(RuleError::InvalidConfig {
                reason: "config contains alerting rules but no notifier is configured".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the running groups ordered by file and name.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| (a.file(), a.name()).cmp(&(b.file(), b.name())));
        groups
    }

    /// Returns the group with the given ID.
    #[must_use]
    pub fn group(&self, id: u64) -> Option<Arc<Group>> {
        self.groups.read().get(&id).cloned()
    }

    /// Returns an alert by group and alert ID.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` naming what could not be found.
    pub fn alert(&self, group_id: u64, alert_id: u64) -> Result<Alert> {
        let group = self.group(group_id).ok_or_else(|| RuleError::NotFound {
            what: format!("group with id {group_id}"),
        })?;
        group.alert(alert_id).ok_or_else(|| RuleError::NotFound {
            what: format!("alert with id {alert_id} in group {:?}", group.name()),
        })
    }

    /// Returns the number of alerting and recording rules across all groups.
    #[must_use]
    pub fn rule_counts(&self) -> (usize, usize) {
        self.groups
            .read()
            .values()
            .flat_map(|g| g.rules())
            .fold((0, 0), |(a, r), rule| match rule.as_ref() {
                Rule::Alerting(_) => (a + 1, r),
                Rule::Recording(_) => (a, r + 1),
            })
    }

    /// Closes every group and waits for them to stop.
    pub async fn close(&self) {
        let groups: Vec<Arc<Group>> = self.groups.write().drain().map(|(_, g)| g).collect();
        join_all(groups.iter().map(|g| g.close())).await;
        for g in &groups {
            self.executor.retain_rules(g.id(), &HashSet::new());
        }
        debug!(groups = groups.len(), "manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::datasource::Querier;
    use crate::notifier::{Notifier, NotifierRegistry};
    use crate::remotewrite::RemoteWrite;
    use crate::testing::{FakeNotifier, FakeQuerier, FakeRemoteWrite};
    use crate::types::Metric;

    fn manager(querier: &Arc<FakeQuerier>, with_rw: bool, with_notifier: bool) -> Manager {
        let notifiers: Vec<Arc<dyn Notifier>> = if with_notifier {
            vec![FakeNotifier::new("fake")]
        } else {
            Vec::new()
        };
        let mut executor = Executor::new(
            Arc::clone(querier) as Arc<dyn Querier>,
            Arc::new(NotifierRegistry::with_notifiers(notifiers)),
        );
        if with_rw {
            executor = executor.with_remote_write(FakeRemoteWrite::new() as Arc<dyn RemoteWrite>);
        }
        Manager::new(executor).with_default_interval(Duration::from_secs(3600))
    }

    fn group(name: &str, rules: Vec<RuleConfig>) -> GroupConfig {
        let mut cfg = GroupConfig::new(name).with_file("rules.yml");
        for r in rules {
            cfg = cfg.with_rule(r);
        }
        cfg.sealed()
    }

    async fn wait_for_eval(g: &Group) {
        for _ in 0..100 {
            if g.iterations() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    mod validation_tests {
        use super::*;

        #[tokio::test]
        async fn recording_rules_need_remote_write() {
            let m = manager(&FakeQuerier::new(), false, true);
            let err = m
                .update(vec![group("g", vec![RuleConfig::recording("r", "up")])], false)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("remote write"));
            assert!(m.groups().is_empty());
        }

        #[tokio::test]
        async fn alerting_rules_need_notifier() {
            let m = manager(&FakeQuerier::new(), true, false);
            let err = m
                .update(vec![group("g", vec![RuleConfig::alerting("a", "up")])], false)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("notifier"));
            assert!(m.groups().is_empty());
        }

        #[tokio::test]
        async fn duplicate_group_ids_rejected() {
            let m = manager(&FakeQuerier::new(), true, true);
            let g = group("g", vec![RuleConfig::recording("r", "up")]);
            assert!(m.update(vec![g.clone(), g], false).await.is_err());
        }
    }

    mod reconcile_tests {
        use super::*;

        #[tokio::test]
        async fn zero_default_interval_keeps_default() {
            let q = FakeQuerier::new();
            let executor = Executor::new(
                Arc::clone(&q) as Arc<dyn Querier>,
                Arc::new(NotifierRegistry::with_notifiers(Vec::new())),
            )
            .with_remote_write(FakeRemoteWrite::new() as Arc<dyn RemoteWrite>);
            let m = Manager::new(executor).with_default_interval(Duration::ZERO);
            m.start(vec![group("g", vec![RuleConfig::recording("r", "up")])])
                .await
                .unwrap();
            let g = m.groups()[0].clone();
            assert_eq!(g.interval(), DEFAULT_INTERVAL);
            wait_for_eval(&g).await;
            assert_eq!(g.iterations(), 1);
            m.close().await;
        }

        #[tokio::test]
        async fn removed_rule_series_not_marked_stale() {
            let q = FakeQuerier::new();
            q.set(vec![Metric::new([("instance", "a")], 1.0)]);
            let rw = FakeRemoteWrite::new();
            let executor = Executor::new(
                Arc::clone(&q) as Arc<dyn Querier>,
                Arc::new(NotifierRegistry::with_notifiers(vec![
                    FakeNotifier::new("fake") as Arc<dyn Notifier>,
                ])),
            )
            .with_remote_write(Arc::clone(&rw) as Arc<dyn RemoteWrite>);
            let m = Manager::new(executor).with_default_interval(Duration::from_secs(3600));

            let cfg = group("g", vec![RuleConfig::recording("r", "up")]);
            m.start(vec![cfg.clone()]).await.unwrap();
            wait_for_eval(&m.groups()[0]).await;
            m.update(Vec::new(), false).await.unwrap();

            rw.clear();
            q.set(Vec::new());
            let g = Group::new(&cfg, Duration::from_secs(3600), &m.renderer);
            g.exec_once(m.executor(), chrono::Utc::now()).await;
            assert!(rw.series().is_empty());
        }

        #[tokio::test]
        async fn adds_removes_and_updates() {
            let q = FakeQuerier::new();
            let m = manager(&q, true, true);
            m.start(vec![
                group("a", vec![RuleConfig::recording("r1", "up")]),
                group("b", vec![RuleConfig::recording("r2", "up")]),
            ])
            .await
            .unwrap();
            let names: Vec<String> = m.groups().iter().map(|g| g.name().to_string()).collect();
            assert_eq!(names, vec!["a", "b"]);
            let a = m.groups()[0].clone();

            m.update(
                vec![
                    group("a", vec![RuleConfig::recording("r1", "up"), RuleConfig::recording("r3", "up")]),
                    group("c", vec![RuleConfig::recording("r4", "up")]),
                ],
                false,
            )
            .await
            .unwrap();

            let names: Vec<String> = m.groups().iter().map(|g| g.name().to_string()).collect();
            assert_eq!(names, vec!["a", "c"]);
            let a_now = m.group(a.id()).unwrap();
            assert!(Arc::ptr_eq(&a, &a_now));
            assert_eq!(a_now.rules().len(), 2);
            assert_eq!(m.rule_counts(), (0, 3));
            m.close().await;
            assert!(m.groups().is_empty());
        }

        #[tokio::test]
        async fn unchanged_update_keeps_alert_state() {
            let q = FakeQuerier::new();
            q.set(vec![Metric::new([("instance", "a")], 1.0)]);
            let m = manager(&q, true, true);
            let cfg = group("g", vec![RuleConfig::alerting("down", "up == 0")]);
            m.start(vec![cfg.clone()]).await.unwrap();
            let g = m.groups()[0].clone();
            wait_for_eval(&g).await;
            let before = g.alerts();
            assert_eq!(before.len(), 1);

            let edited = group(
                "g",
                vec![
                    RuleConfig::alerting("down", "up == 0"),
                    RuleConfig::alerting("other", "up == 2").with_annotation("summary", "x"),
                ],
            );
            m.update(vec![edited], false).await.unwrap();

            let after = m.group(g.id()).unwrap().alerts();
            assert_eq!(after.len(), 1);
            assert_eq!(after[0].id, before[0].id);
            assert_eq!(after[0].start, before[0].start);

            let found = m.alert(g.id(), before[0].id).unwrap();
            assert_eq!(found.name, "down");
            assert!(matches!(m.alert(g.id(), 1), Err(RuleError::NotFound { .. })));
            assert!(m.alert(1, before[0].id).is_err());
            m.close().await;
        }
    }
}
