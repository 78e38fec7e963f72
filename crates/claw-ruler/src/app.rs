//! Wires rule files, datasource, remote storage and notifiers together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use claw_rules::{
    DefaultRenderer, Executor, GroupConfig, Manager, NotifierRegistry, PrometheusClient,
    PrometheusClientConfig, Querier, RemoteWrite, RemoteWriteClient, RemoteWriteConfig,
    ReplayConfig, RestoreConfig, TemplateRenderer, config,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{DatasourceArgs, ReplayArgs, RunArgs};

/// Signals the evaluation loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Re-read rule files and notifier configuration.
    Reload,
    /// Stop all groups and exit.
    Shutdown,
}

/// Expands Alertmanager base URLs into their alerts API endpoints.
pub fn notifier_endpoints(urls: &[String]) -> Vec<String> {
    urls.iter()
        .map(|u| format!("{}/api/v2/alerts", u.trim_end_matches('/')))
        .collect()
}

/// Loads and validates rule files.
pub fn load_rules(paths: &[PathBuf]) -> anyhow::Result<Vec<GroupConfig>> {
    let groups = config::load(paths).context("failed to load rule files")?;
    let rules: usize = groups.iter().map(|g| g.rules.len()).sum();
    info!(files = paths.len(), groups = groups.len(), rules, "loaded rule files");
    Ok(groups)
}

fn datasource_config(args: &DatasourceArgs) -> PrometheusClientConfig {
    let mut cfg = PrometheusClientConfig::new(&args.datasource_url).with_step(args.evaluation_interval);
    cfg.timeout = args.datasource_timeout;
    cfg.lookback = args.datasource_lookback;
    cfg
}

fn datasource(args: &DatasourceArgs) -> anyhow::Result<Arc<PrometheusClient>> {
    let client = PrometheusClient::new(datasource_config(args)).context("failed to create datasource client")?;
    Ok(Arc::new(client))
}

fn remote_write(url: &str) -> anyhow::Result<Arc<RemoteWriteClient>> {
    let client = RemoteWriteClient::new(RemoteWriteConfig::new(url))
        .context("failed to create remote write client")?;
    Ok(Arc::new(client))
}

async fn notifiers(args: &RunArgs) -> anyhow::Result<Arc<NotifierRegistry>> {
    let registry = match &args.notifier_config {
        Some(path) => NotifierRegistry::from_config_file(path)
            .await
            .with_context(|| format!("failed to load notifier config {}", path.display()))?,
        None => NotifierRegistry::from_urls(&notifier_endpoints(&args.notifier_urls), args.notifier_timeout)
            .context("failed to create notifiers")?,
    };
    Ok(Arc::new(registry))
}

/// Re-reads rule files and applies them to a running manager.
///
/// A file that fails to load or validate leaves the running groups untouched.
/// Returns whether the new configuration was applied.
pub async fn reload_rules(paths: &[PathBuf], manager: &Manager) -> bool {
    let groups = match load_rules(paths) {
        Ok(groups) => groups,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to reload rules, keeping previous configuration");
            return false;
        }
    };
    match manager.update(groups, false).await {
        Ok(()) => {
            info!("rules reloaded");
            true
        }
        Err(e) => {
            error!(error = %e, "failed to apply reloaded rules, keeping previous configuration");
            false
        }
    }
}

async fn reload(paths: &[PathBuf], manager: &Manager, registry: &NotifierRegistry) {
    match registry.reload().await {
        Ok(true) => {}
        Ok(false) => info!("notifier reload already in progress"),
        Err(e) => warn!(error = %e, "failed to reload notifier config, keeping previous targets"),
    }
    reload_rules(paths, manager).await;
}

#[cfg(unix)]
async fn signals(cancel: CancellationToken, tx: tokio::sync::mpsc::Sender<Signal>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        let sig = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = hup.recv() => Signal::Reload,
            _ = term.recv() => Signal::Shutdown,
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                Signal::Shutdown
            }
        };
        if tx.send(sig).await.is_err() || sig == Signal::Shutdown {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn signals(cancel: CancellationToken, tx: tokio::sync::mpsc::Sender<Signal>) -> anyhow::Result<()> {
    tokio::select! {
        () = cancel.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            let _ = tx.send(Signal::Shutdown).await;
        }
    }
    Ok(())
}

/// Evaluates rules until a shutdown signal arrives, reloading on SIGHUP.
pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let groups = load_rules(&args.datasource.rules)?;
    let querier = datasource(&args.datasource)?;
    let registry = notifiers(&args).await?;
    let rw = args
        .datasource
        .remote_write_url
        .as_deref()
        .map(remote_write)
        .transpose()?;

    let mut executor = Executor::new(Arc::clone(&querier) as Arc<dyn Querier>, Arc::clone(&registry))
        .with_external_url(args.external_url.as_str())
        .with_resend_delay(args.rule_resend_delay);
    if let Some(rw) = &rw {
        executor = executor.with_remote_write(Arc::clone(rw) as Arc<dyn RemoteWrite>);
    }

    let mut manager = Manager::new(executor).with_default_interval(args.datasource.evaluation_interval);
    if let Some(url) = &args.remote_read_url {
        let client = PrometheusClient::new(PrometheusClientConfig::new(url))
            .context("failed to create remote read client")?;
        manager = manager.with_restore(RestoreConfig {
            querier: Arc::new(client),
            lookback: args.remote_read_lookback,
        });
    }

    manager.start(groups).await.context("failed to start rule groups")?;
    let (alerting, recording) = manager.rule_counts();
    info!(
        datasource = %querier.url(),
        groups = manager.groups().len(),
        alerting,
        recording,
        "claw-ruler started"
    );

    let cancel = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let listener = tokio::spawn(signals(cancel.clone(), tx));

    while let Some(sig) = rx.recv().await {
        match sig {
            Signal::Reload => {
                info!("received reload signal");
                reload(&args.datasource.rules, &manager, &registry).await;
            }
            Signal::Shutdown => {
                info!("received shutdown signal");
                break;
            }
        }
    }
    cancel.cancel();

    manager.close().await;
    if let Some(rw) = rw {
        if let Err(e) = rw.close().await {
            warn!(error = %e, "failed to close remote write client");
        }
    }
    registry.close().await;

    match listener.await {
        Ok(res) => res?,
        Err(e) => warn!(error = %e, "signal listener terminated abnormally"),
    }
    info!("claw-ruler stopped");
    Ok(())
}

/// Backfills rule results over `[from, to)` and exits.
pub async fn replay(args: ReplayArgs) -> anyhow::Result<()> {
    let Some(url) = args.datasource.remote_write_url.as_deref() else {
        bail!("replay requires --remote-write-url");
    };
    let groups = load_rules(&args.datasource.rules)?;
    let querier = datasource(&args.datasource)?;
    let rw = remote_write(url)?;

    let cfg = ReplayConfig {
        max_datapoints: args.max_datapoints,
        rule_retry_attempts: args.rule_retry_attempts,
        rules_delay: args.rules_delay,
        default_interval: args.datasource.evaluation_interval,
        ..ReplayConfig::new(args.from, args.to)
    };
    cfg.validate().context("invalid replay range")?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping replay");
                cancel.cancel();
            }
        })
    };

    let renderer: Arc<dyn TemplateRenderer> = Arc::new(DefaultRenderer::new());
    info!(from = %cfg.from, to = %cfg.to, groups = groups.len(), "starting replay");
    let result = claw_rules::replay(&groups, querier.as_ref(), rw.as_ref(), &renderer, &cfg, &cancel).await;
    interrupt.abort();

    if let Err(e) = rw.close().await {
        warn!(error = %e, "failed to close remote write client");
    }
    let samples = result.context("replay failed")?;
    info!(samples, "replay finished");
    Ok(())
}

/// Validates rule files without contacting any service.
pub fn check(paths: &[PathBuf]) -> anyhow::Result<()> {
    let groups = load_rules(paths)?;
    for g in &groups {
        info!(file = %g.file, group = %g.name, rules = g.rules.len(), "group ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod endpoint_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("http://am:9093", "http://am:9093/api/v2/alerts" ; "bare host")]
        #[test_case("http://am:9093/", "http://am:9093/api/v2/alerts" ; "trailing slash")]
        #[test_case("https://am.example/prefix", "https://am.example/prefix/api/v2/alerts" ; "path prefix")]
        fn test_notifier_endpoints(base: &str, want: &str) {
            assert_eq!(notifier_endpoints(&[base.to_string()]), vec![want.to_string()]);
        }
    }

    mod datasource_tests {
        use super::*;
        use crate::cli::{Cli, Commands};
        use clap::Parser;
        use std::time::Duration;

        #[test]
        fn test_datasource_flags_reach_client_config() {
            let cli = Cli::try_parse_from([
                "claw-ruler",
                "run",
                "--rule",
                "a.yml",
                "--datasource-url",
                "http://vm:8428",
                "--datasource-lookback",
                "2m",
                "--datasource-timeout",
                "5s",
                "--evaluation-interval",
                "15s",
            ])
            .unwrap();
            let Commands::Run(args) = cli.command else {
                unreachable!("expected run")
            };

            let cfg = datasource_config(&args.datasource);
            assert_eq!(cfg.lookback, Duration::from_secs(120));
            assert_eq!(cfg.timeout, Duration::from_secs(5));
            assert_eq!(cfg.step, Some(Duration::from_secs(15)));
        }
    }

    mod reload_tests {
        use super::*;
        use std::time::Duration;

        const RULES: &str = r"
groups:
  - name: node
    rules:
      - alert: InstanceDown
        expr: up == 0
";

        fn manager() -> Manager {
            // Nothing listens on port 1, evaluation errors are only logged.
            let querier = PrometheusClient::new(PrometheusClientConfig::new("http://127.0.0.1:1")).unwrap();
            let registry =
                NotifierRegistry::from_urls(&notifier_endpoints(&["http://127.0.0.1:1".to_string()]), Duration::from_secs(1))
                    .unwrap();
            Manager::new(Executor::new(Arc::new(querier), Arc::new(registry)))
                .with_default_interval(Duration::from_secs(3600))
        }

        #[tokio::test]
        async fn test_reload_applies_valid_files() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("node.yml");
            std::fs::write(&path, RULES).unwrap();
            let manager = manager();
            manager.start(load_rules(&[path.clone()]).unwrap()).await.unwrap();

            std::fs::write(&path, RULES.replace("name: node", "name: nodes")).unwrap();
            assert!(reload_rules(&[path], &manager).await);
            assert_eq!(manager.groups()[0].name(), "nodes");
            manager.close().await;
        }

        #[tokio::test]
        async fn test_reload_keeps_config_on_broken_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("node.yml");
            std::fs::write(&path, RULES).unwrap();
            let manager = manager();
            manager.start(load_rules(&[path.clone()]).unwrap()).await.unwrap();

            std::fs::write(&path, "groups: [").unwrap();
            assert!(!reload_rules(&[path], &manager).await);
            let groups = manager.groups();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].name(), "node");
            manager.close().await;
        }

        #[test]
        fn test_check_rejects_missing_file() {
            assert!(check(&[PathBuf::from("/nonexistent/rules.yml")]).is_err());
        }
    }
}
