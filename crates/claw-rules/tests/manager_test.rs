//! Manager reconciliation driven by rule files on disk.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use claw_rules::{
    AlertState, Executor, GroupState, Manager, Notifier, NotifierRegistry, Querier, RemoteWrite,
    config,
};
use common::{MemoryWrite, RecordingNotifier, TableQuerier, row};
use tempfile::TempDir;

// ==================== Helper Functions ====================

struct Fixture {
    dir: TempDir,
    querier: Arc<TableQuerier>,
    write: Arc<MemoryWrite>,
    notifier: Arc<RecordingNotifier>,
    manager: Manager,
}

fn fixture() -> Fixture {
    let querier = TableQuerier::new();
    let write = MemoryWrite::new();
    let notifier = RecordingNotifier::new();
    let registry = NotifierRegistry::with_notifiers(vec![Arc::clone(&notifier) as Arc<dyn Notifier>]);
    let executor = Executor::new(Arc::clone(&querier) as Arc<dyn Querier>, Arc::new(registry))
        .with_remote_write(Arc::clone(&write) as Arc<dyn RemoteWrite>)
        .with_external_url("http://ruler:8880");
    let manager = Manager::new(executor).with_default_interval(Duration::from_secs(3600));
    Fixture {
        dir: TempDir::new().expect("temp dir"),
        querier,
        write,
        notifier,
        manager,
    }
}

impl Fixture {
    fn write_rules(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write rules");
        path
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached");
}

const NODE_RULES: &str = r#"
groups:
  - name: node
    rules:
      - alert: InstanceDown
        expr: up == 0
        annotations:
          summary: "{{ $labels.instance }} down"
      - record: job:up:sum
        expr: sum(up) by (job)
"#;

const NODE_RULES_EDITED: &str = r#"
groups:
  - name: node
    rules:
      - alert: InstanceDown
        expr: up == 0
        annotations:
          summary: "{{ $labels.instance }} down"
      - alert: HighLoad
        expr: load > 10
"#;

// ==================== Reconciliation Tests ====================

#[tokio::test]
async fn test_start_evaluates_and_dispatches() {
    let f = fixture();
    f.querier.set("up == 0", vec![row(&[("instance", "a")], 0.0)]);
    f.querier.set("sum(up) by (job)", vec![row(&[("job", "node")], 3.0)]);
    let path = f.write_rules("node.yml", NODE_RULES);

    f.manager.start(config::load(&[path]).unwrap()).await.unwrap();
    let group = f.manager.groups()[0].clone();
    eventually(|| group.iterations() > 0).await;

    let batches = f.notifier.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].annotations["summary"], "a down");
    assert!(batches[0][0].generator_url.starts_with("http://ruler:8880/api/v1/"));

    let names: Vec<String> = f
        .write
        .take()
        .iter()
        .filter_map(|s| s.name().map(str::to_string))
        .collect();
    assert!(names.contains(&"ALERTS".to_string()));
    assert!(names.contains(&"job:up:sum".to_string()));
    f.manager.close().await;
}

#[tokio::test]
async fn test_reload_preserves_alert_state_of_unchanged_rule() {
    let f = fixture();
    f.querier.set("up == 0", vec![row(&[("instance", "a")], 0.0)]);
    let path = f.write_rules("node.yml", NODE_RULES);
    f.manager.start(config::load(&[path.clone()]).unwrap()).await.unwrap();
    let group = f.manager.groups()[0].clone();
    eventually(|| group.iterations() > 0).await;
    let before = group.alerts();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].state, AlertState::Firing);

    f.write_rules("node.yml", NODE_RULES_EDITED);
    f.manager
        .update(config::load(&[path]).unwrap(), false)
        .await
        .unwrap();

    let same = f.manager.group(group.id()).unwrap();
    assert!(Arc::ptr_eq(&same, &group));
    assert_eq!(same.rules().len(), 2);
    let after = same.alerts();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].start, before[0].start);
    assert_eq!(f.manager.rule_counts(), (2, 0));
    f.manager.close().await;
}

#[tokio::test]
async fn test_renamed_group_is_replaced() {
    let f = fixture();
    let path = f.write_rules("node.yml", NODE_RULES);
    f.manager.start(config::load(&[path.clone()]).unwrap()).await.unwrap();
    let old = f.manager.groups()[0].clone();

    f.write_rules("node.yml", &NODE_RULES.replace("name: node", "name: nodes"));
    f.manager
        .update(config::load(&[path]).unwrap(), false)
        .await
        .unwrap();

    assert_eq!(old.state(), GroupState::Stopped);
    let groups = f.manager.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name(), "nodes");
    assert!(f.manager.group(old.id()).is_none());
    f.manager.close().await;
}

#[tokio::test]
async fn test_invalid_file_keeps_running_config() {
    let f = fixture();
    let path = f.write_rules("node.yml", NODE_RULES);
    f.manager.start(config::load(&[path.clone()]).unwrap()).await.unwrap();

    f.write_rules("node.yml", "groups:\n  - name: node\n    rules:\n      - expr: up\n");
    assert!(config::load(&[path]).is_err());

    let groups = f.manager.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].state(), GroupState::Running);
    f.manager.close().await;
}

#[tokio::test]
async fn test_groups_sorted_across_files() {
    let f = fixture();
    let b = f.write_rules("b.yml", NODE_RULES);
    let a = f.write_rules("a.yml", &NODE_RULES.replace("name: node", "name: zeta"));
    f.manager.start(config::load(&[b, a]).unwrap()).await.unwrap();

    let names: Vec<String> = f.manager.groups().iter().map(|g| g.name().to_string()).collect();
    assert_eq!(names, vec!["zeta", "node"]);
    f.manager.close().await;
}
