//! Rule groups and their evaluation loop.
//!
//! A [`Group`] owns an ordered list of rules sharing one interval. Once
//! started it runs on its own task: the first evaluation happens immediately,
//! later ones follow the interval. Updates are delivered to the running task
//! so that rule definitions are never patched in the middle of an evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GroupConfig;
use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::notifier::{AlertUrlGenerator, NotifierRegistry};
use crate::remotewrite::RemoteWrite;
use crate::rule::Rule;
use crate::template::TemplateRenderer;
use crate::hash;
use crate::types::{
    Alert, Labels, Sample, TimeSeries, is_stale_nan, labels_to_map, map_to_labels, stale_nan,
};

/// Default evaluation interval for groups that do not set one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// How long sent alerts stay valid at the receiver without being re-sent.
#[must_use]
pub fn resolve_duration(interval: Duration, resend_delay: Duration) -> Duration {
    interval.max(resend_delay) * 4
}

/// Series pushed by the previous evaluation of a rule, keyed by series hash.
type SentSeries = HashMap<u64, Labels>;

/// Routes rule results to remote storage and notifiers.
///
/// Series a rule stops producing are closed with a staleness marker on the
/// next evaluation.
#[derive(Debug)]
pub struct Executor {
    querier: Arc<dyn Querier>,
    notifiers: Arc<NotifierRegistry>,
    remote_write: Option<Arc<dyn RemoteWrite>>,
    url_gen: AlertUrlGenerator,
    resend_delay: Duration,
    // (group id, rule id)
    sent_series: Mutex<HashMap<(u64, u64), SentSeries>>,
}

impl Executor {
    /// Creates an executor querying `querier` and notifying `notifiers`.
    #[must_use]
    pub fn new(querier: Arc<dyn Querier>, notifiers: Arc<NotifierRegistry>) -> Self {
        Self {
            querier,
            notifiers,
            remote_write: None,
            url_gen: AlertUrlGenerator::default(),
            resend_delay: Duration::ZERO,
            sent_series: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the sink for recorded and alert state series.
    #[must_use]
    pub fn with_remote_write(mut self, rw: Arc<dyn RemoteWrite>) -> Self {
        self.remote_write = Some(rw);
        self
    }

    /// Sets the external URL used for alert generator links.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.url_gen = AlertUrlGenerator::new(url);
        self
    }

    /// Sets the minimum delay between re-sends of the same alert.
    #[must_use]
    pub const fn with_resend_delay(mut self, delay: Duration) -> Self {
        self.resend_delay = delay;
        self
    }

    /// Returns the datasource.
    #[must_use]
    pub fn querier(&self) -> &Arc<dyn Querier> {
        &self.querier
    }

    /// Returns the notifier registry.
    #[must_use]
    pub const fn notifiers(&self) -> &Arc<NotifierRegistry> {
        &self.notifiers
    }

    /// Returns `true` if a remote write sink is configured.
    #[must_use]
    pub const fn has_remote_write(&self) -> bool {
        self.remote_write.is_some()
    }

    /// Evaluates one rule of group `group_id` at `ts` and routes its results.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, or the push and notification errors
    /// collected after a successful evaluation.
    pub async fn exec_rule(
        &self,
        group_id: u64,
        rule: &Rule,
        ts: DateTime<Utc>,
        interval: Duration,
        limit: usize,
    ) -> Result<()> {
        let key = (group_id, rule.id());
        match rule {
            Rule::Recording(r) => {
                let series = r.exec(self.querier.as_ref(), ts, limit).await?;
                self.push(self.with_stale_markers(key, series, ts))
            }
            Rule::Alerting(r) => {
                r.exec(self.querier.as_ref(), ts, limit, false).await?;
                let series = self.with_stale_markers(key, r.series_to_push(ts), ts);
                let push_result = self.push(series);

                let mut alerts = r.alerts_to_send(
                    ts,
                    resolve_duration(interval, self.resend_delay),
                    self.resend_delay,
                );
                for a in &mut alerts {
                    a.generator_url = self.url_gen.url(a);
                }
                let send_result = self.send(&alerts).await;
                push_result.and(send_result)
            }
        }
    }

    /// Evaluates `rules` at `ts` with at most `concurrency` in flight.
    ///
    /// With `concurrency <= 1` rules run one after another in order. Results are
    /// returned in rule order either way.
    pub async fn exec_concurrently(
        &self,
        group_id: u64,
        rules: &[Arc<Rule>],
        ts: DateTime<Utc>,
        interval: Duration,
        limit: usize,
        concurrency: usize,
    ) -> Vec<Result<()>> {
        if concurrency <= 1 {
            let mut out = Vec::with_capacity(rules.len());
            for rule in rules {
                out.push(self.exec_rule(group_id, rule, ts, interval, limit).await);
            }
            return out;
        }
        let evals: Vec<_> = rules
            .iter()
            .map(|rule| self.exec_rule(group_id, rule, ts, interval, limit))
            .collect();
        futures::stream::iter(evals)
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Drops the remembered series of rules of `group_id` not in `rule_ids`.
    pub fn retain_rules(&self, group_id: u64, rule_ids: &HashSet<u64>) {
        self.sent_series
            .lock()
            .retain(|(g, r), _| *g != group_id || rule_ids.contains(r));
    }

    /// Appends a staleness marker at `ts` for every series the rule pushed on
    /// its previous evaluation but not on this one.
    fn with_stale_markers(
        &self,
        key: (u64, u64),
        mut series: Vec<TimeSeries>,
        ts: DateTime<Utc>,
    ) -> Vec<TimeSeries> {
        // Series the rule closes itself already carry a marker.
        let mut closed = HashSet::new();
        let mut current = SentSeries::new();
        for s in &series {
            let h = hash::series_hash(&s.labels);
            if s.samples.last().is_some_and(|x| is_stale_nan(x.value)) {
                closed.insert(h);
            } else {
                current.insert(h, labels_to_map(&s.labels));
            }
        }

        let mut sent = self.sent_series.lock();
        if let Some(previous) = sent.get(&key) {
            let timestamp = ts.timestamp_millis();
            let stale = previous
                .iter()
                .filter(|(h, _)| !current.contains_key(*h) && !closed.contains(*h))
                .map(|(_, labels)| TimeSeries {
                    labels: map_to_labels(labels),
                    samples: vec![Sample {
                        value: stale_nan(),
                        timestamp,
                    }],
                });
            series.extend(stale);
        }
        if current.is_empty() {
            sent.remove(&key);
        } else {
            sent.insert(key, current);
        }
        series
    }

    fn push(&self, series: Vec<TimeSeries>) -> Result<()> {
        let Some(rw) = &self.remote_write else {
            return Ok(());
        };
        let mut failed = 0;
        let mut last = None;
        for s in series {
            if let Err(e) = rw.push(s) {
                failed += 1;
                last = Some(e);
            }
        }
        match last {
            None => Ok(()),
            Some(e) => Err(RuleError::RemoteWrite {
                reason: format!("failed to push {failed} series: {e}"),
            }),
        }
    }

    async fn send(&self, alerts: &[Alert]) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        let notifiers = self.notifiers.notifiers();
        let results = join_all(notifiers.iter().map(|n| n.send(alerts))).await;
        let errors: Vec<String> = notifiers
            .iter()
            .zip(results)
            .filter_map(|(n, r)| r.err().map(|e| format!("{}: {e}", n.addr())))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Notify {
                reason: errors.join("; "),
            })
        }
    }
}

/// Source of previously persisted alert state.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Datasource holding `ALERTS_FOR_STATE` series.
    pub querier: Arc<dyn Querier>,
    /// How far back to look for state.
    pub lookback: Duration,
}

/// Lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Built but not started.
    Created,
    /// Evaluation loop is running.
    Running,
    /// Closed. Terminal.
    Stopped,
}

#[derive(Debug)]
struct GroupSpec {
    interval: Duration,
    concurrency: usize,
    limit: usize,
    labels: Labels,
    checksum: u64,
    rules: Vec<Arc<Rule>>,
}

struct GroupUpdate {
    group: Group,
    ack: oneshot::Sender<()>,
}

/// A set of rules evaluated together on one interval.
#[derive(Debug)]
pub struct Group {
    id: u64,
    name: String,
    file: String,
    spec: RwLock<GroupSpec>,
    state: Mutex<GroupState>,
    shutdown: CancellationToken,
    eval_cancel: Mutex<CancellationToken>,
    updates: Mutex<Option<mpsc::Sender<GroupUpdate>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    iterations: AtomicU64,
    eval_errors: AtomicU64,
    last_eval: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for GroupUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupUpdate")
            .field("group", &self.group.name)
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Builds a group from its configuration.
    ///
    /// Groups without an interval use `default_interval`, or
    /// [`DEFAULT_INTERVAL`] when that is zero.
    #[must_use]
    pub fn new(
        cfg: &GroupConfig,
        default_interval: Duration,
        renderer: &Arc<dyn TemplateRenderer>,
    ) -> Self {
        let id = cfg.id();
        let rules = cfg
            .rules
            .iter()
            .map(|r| Arc::new(Rule::from_config(r, id, &cfg.labels, Arc::clone(renderer))))
            .collect();
        let fallback = if default_interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            default_interval
        };
        let interval = cfg.interval.filter(|d| !d.is_zero()).unwrap_or(fallback);
        Self {
            id,
            name: cfg.name.clone(),
            file: cfg.file.clone(),
            spec: RwLock::new(GroupSpec {
                interval,
                concurrency: cfg.concurrency.max(1),
                limit: cfg.limit,
                labels: cfg.labels.clone(),
                checksum: cfg.checksum,
                rules,
            }),
            state: Mutex::new(GroupState::Created),
            shutdown: CancellationToken::new(),
            eval_cancel: Mutex::new(CancellationToken::new()),
            updates: Mutex::new(None),
            handle: Mutex::new(None),
            iterations: AtomicU64::new(0),
            eval_errors: AtomicU64::new(0),
            last_eval: RwLock::new(None),
        }
    }

    /// Returns the identity of the group, derived from its file and name.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the file the group was loaded from.
    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Returns the evaluation interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.spec.read().interval
    }

    /// Returns the maximum number of rules evaluated at once.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.spec.read().concurrency
    }

    /// Returns the per-rule result limit, `0` for none.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.spec.read().limit
    }

    /// Returns the group labels.
    #[must_use]
    pub fn labels(&self) -> Labels {
        self.spec.read().labels.clone()
    }

    /// Returns the configuration checksum.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.spec.read().checksum
    }

    /// Returns the rules in declared order.
    #[must_use]
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.spec.read().rules.clone()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> GroupState {
        *self.state.lock()
    }

    /// Returns the number of completed evaluations.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Returns the number of failed rule evaluations.
    #[must_use]
    pub fn eval_errors(&self) -> u64 {
        self.eval_errors.load(Ordering::SeqCst)
    }

    /// Returns the timestamp of the last completed evaluation.
    #[must_use]
    pub fn last_eval(&self) -> Option<DateTime<Utc>> {
        *self.last_eval.read()
    }

    /// Returns all alerts of all alerting rules.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.rules()
            .iter()
            .filter_map(|r| match r.as_ref() {
                Rule::Alerting(a) => Some(a.alerts()),
                Rule::Recording(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Returns the alert with the given ID.
    #[must_use]
    pub fn alert(&self, alert_id: u64) -> Option<Alert> {
        self.rules().iter().find_map(|r| match r.as_ref() {
            Rule::Alerting(a) => a.alert(alert_id),
            Rule::Recording(_) => None,
        })
    }

    /// Evaluates every rule once at `ts`.
    ///
    /// Failures are logged and counted; one failing rule does not stop the
    /// others.
    pub async fn exec_once(&self, executor: &Executor, ts: DateTime<Utc>) {
        let (rules, interval, limit, concurrency) = {
            let spec = self.spec.read();
            (spec.rules.clone(), spec.interval, spec.limit, spec.concurrency)
        };
        let results = executor
            .exec_concurrently(self.id, &rules, ts, interval, limit, concurrency)
            .await;

        for (rule, result) in rules.iter().zip(results) {
            if let Err(e) = result {
                self.eval_errors.fetch_add(1, Ordering::SeqCst);
                warn!(group = %self.name, rule = %rule.name(), error = %e, "rule evaluation failed");
            }
        }
        self.iterations.fetch_add(1, Ordering::SeqCst);
        *self.last_eval.write() = Some(ts);
        debug!(group = %self.name, rules = rules.len(), "group evaluated");
    }

    /// Restores alert state of alerting rules with a `for` duration.
    pub async fn restore(&self, restore: &RestoreConfig, ts: DateTime<Utc>) {
        for rule in self.rules() {
            if let Rule::Alerting(a) = rule.as_ref() {
                if let Err(e) = a.restore(restore.querier.as_ref(), ts, restore.lookback).await {
                    warn!(group = %self.name, rule = %a.name(), error = %e, "failed to restore alerts state");
                }
            }
        }
    }

    /// Starts the evaluation loop.
    ///
    /// Alert state is restored first when `restore` is set. Calling `start` on
    /// a group that is not in the created state does nothing.
    pub fn start(self: &Arc<Self>, executor: Arc<Executor>, restore: Option<RestoreConfig>) {
        {
            let mut state = self.state.lock();
            if *state != GroupState::Created {
                return;
            }
            *state = GroupState::Running;
        }

        let (tx, rx) = mpsc::channel(1);
        *self.updates.lock() = Some(tx);

        let group = Arc::clone(self);
        let handle = tokio::spawn(async move { group.run(executor, restore, rx).await });
        *self.handle.lock() = Some(handle);
        info!(group = %self.name, file = %self.file, interval = ?self.interval(), "started group");
    }

    async fn run(
        self: Arc<Self>,
        executor: Arc<Executor>,
        restore: Option<RestoreConfig>,
        mut updates: mpsc::Receiver<GroupUpdate>,
    ) {
        if let Some(restore) = &restore {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = self.restore(restore, Utc::now()) => {}
            }
        }

        let mut interval = self.interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(update) = updates.recv() => {
                    self.apply_update(update.group);
                    let next = self.interval();
                    if next != interval {
                        interval = next;
                        ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        debug!(group = %self.name, interval = ?interval, "ticker reset");
                    }
                    let _ = update.ack.send(());
                }
                _ = ticker.tick() => {
                    let token = self.shutdown.child_token();
                    *self.eval_cancel.lock() = token.clone();
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!(group = %self.name, "evaluation interrupted");
                        }
                        () = self.exec_once(&executor, Utc::now()) => {}
                    }
                }
            }
        }
        debug!(group = %self.name, "evaluation loop stopped");
    }

    /// Cancels the evaluation in flight, if any.
    pub fn interrupt_eval(&self) {
        self.eval_cancel.lock().cancel();
    }

    /// Replaces the definition of this group with `new`.
    ///
    /// Rules are matched by ID: surviving rules keep their alerts and health
    /// history and only have their definition patched, vanished rules are
    /// dropped and new ones are added. The rule order of `new` is kept. On a
    /// running group the evaluation in flight is interrupted and the update is
    /// applied by the evaluation task.
    pub async fn update_with(&self, new: Group) {
        let sender = self.updates.lock().clone();
        let Some(sender) = sender else {
            self.apply_update(new);
            return;
        };

        self.interrupt_eval();
        let (ack, done) = oneshot::channel();
        match sender.send(GroupUpdate { group: new, ack }).await {
            Ok(()) => {
                // A tick may have started between the first interrupt and the send.
                self.interrupt_eval();
                if done.await.is_err() {
                    debug!(group = %self.name, "group stopped before applying update");
                }
            }
            Err(mpsc::error::SendError(update)) => self.apply_update(update.group),
        }
    }

    fn apply_update(&self, new: Group) {
        let new_spec = new.spec.into_inner();
        let mut spec = self.spec.write();

        let current: HashMap<u64, Arc<Rule>> =
            spec.rules.iter().map(|r| (r.id(), Arc::clone(r))).collect();
        let mut kept = 0;
        let rules = new_spec
            .rules
            .into_iter()
            .map(|candidate| match current.get(&candidate.id()) {
                Some(existing) => match existing.update_with(&candidate) {
                    Ok(()) => {
                        kept += 1;
                        Arc::clone(existing)
                    }
                    Err(e) => {
                        warn!(group = %self.name, error = %e, "replacing rule");
                        candidate
                    }
                },
                None => candidate,
            })
            .collect::<Vec<_>>();

        let added = rules.len() - kept;
        let removed = spec.rules.len() - kept;
        spec.rules = rules;
        spec.interval = new_spec.interval;
        spec.concurrency = new_spec.concurrency;
        spec.limit = new_spec.limit;
        spec.labels = new_spec.labels;
        spec.checksum = new_spec.checksum;
        info!(group = %self.name, kept, added, removed, "updated group");
    }

    /// Stops the evaluation loop and waits for it to exit.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == GroupState::Stopped {
                return;
            }
            *state = GroupState::Stopped;
        }
        self.shutdown.cancel();
        self.updates.lock().take();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(group = %self.name, error = %e, "group task failed");
            }
        }
        info!(group = %self.name, "stopped group");
    }
}
