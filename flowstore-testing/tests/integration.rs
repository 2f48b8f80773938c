//! Integration tests for the flow store.
//!
//! Each test wires real flow tables through the in-memory cluster
//! harness and exercises the replication protocols end to end: backup
//! push, anti-entropy repair, and mastership handover.

use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use flowstore::{TableConfig, TableError};
use flowstore_core::{AppId, DeviceId, FlowState, NodeId};
use flowstore_testing::{LocalCluster, test_entry, test_rule};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowstore=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Short periods so replication converges within a test run.
fn fast_config() -> TableConfig {
    TableConfig {
        backup_period: Duration::from_millis(25),
        anti_entropy_period: Duration::from_millis(100),
        sync_timeout: Duration::from_millis(250),
    }
}

/// Poll `condition` until it holds, or fail after five seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn master_accepts_writes_and_replicates_to_backups() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let master = cluster.table(device, NodeId(1), fast_config());
    let backup = cluster.table(device, NodeId(2), fast_config());

    let rule = test_rule(device, 42, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");

    assert_eq!(master.count(), 1);
    assert!(master.flow_entry(&rule).is_some());

    eventually("entry to replicate to the backup", || {
        backup.flow_entry(&rule).is_some()
    })
    .await;
    assert_eq!(backup.count(), 1);
    assert!(cluster.backups_delivered(device, NodeId(2)) >= 1);
}

#[tokio::test]
async fn writes_are_rejected_on_non_masters() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let backup = cluster.table(device, NodeId(2), fast_config());

    let error = backup
        .add(test_entry(test_rule(device, 1, 1), 100))
        .await
        .expect_err("write on a backup");
    assert!(matches!(
        error.current_context(),
        TableError::NotMaster(rejected) if *rejected == device
    ));
}

#[tokio::test]
async fn stale_writes_are_dropped() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), Vec::new());
    let master = cluster.table(device, NodeId(1), fast_config());

    let rule = test_rule(device, 7, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");

    // An update carrying an older creation time refers to a previous
    // incarnation of the flow and must not clobber the current one.
    let mut stale = test_entry(rule.clone(), 50);
    stale.state = FlowState::Added;
    master.update(stale.clone()).await.expect("update");
    let stored = master.flow_entry(&rule).expect("entry present");
    assert_eq!(stored.created, 100);
    assert_eq!(stored.state, FlowState::PendingAdd);

    // Same for removal: the stale remove is rejected outright.
    let removed = master.remove(stale).await.expect("remove");
    assert!(removed.is_none());
    assert!(master.flow_entry(&rule).is_some());

    // A removal for the current incarnation goes through.
    let removed = master
        .remove(test_entry(rule.clone(), 100))
        .await
        .expect("remove");
    assert_eq!(removed.expect("entry removed").created, 100);
    assert!(master.flow_entry(&rule).is_none());
}

#[tokio::test]
async fn current_updates_apply() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), Vec::new());
    let master = cluster.table(device, NodeId(1), fast_config());

    let rule = test_rule(device, 7, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");

    let mut confirmed = test_entry(rule.clone(), 100);
    confirmed.state = FlowState::Added;
    master.update(confirmed).await.expect("update");

    assert_eq!(
        master.flow_entry(&rule).expect("entry present").state,
        FlowState::Added
    );
}

#[tokio::test]
async fn update_with_transforms_the_stored_entry() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), Vec::new());
    let master = cluster.table(device, NodeId(1), fast_config());

    let rule = test_rule(device, 9, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");

    let bytes = master
        .update_with(rule.clone(), |entry| {
            entry.bytes += 1500;
            entry.packets += 1;
            Some(entry.bytes)
        })
        .await
        .expect("update_with");
    assert_eq!(bytes, Some(1500));
    assert_eq!(master.flow_entry(&rule).expect("entry present").packets, 1);

    // Applying to an unknown rule returns nothing.
    let missing = master
        .update_with(test_rule(device, 10, 1), |_| Some(()))
        .await
        .expect("update_with");
    assert!(missing.is_none());
}

#[tokio::test]
async fn reads_are_forwarded_to_the_master() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let master = cluster.table(device, NodeId(1), fast_config());
    let backup = cluster.table(device, NodeId(2), fast_config());

    // Flows 1 and 1025 share a bucket; 2 lands in another.
    for flow in [1, 2, 1025] {
        master
            .add(test_entry(test_rule(device, flow, 1), 100))
            .await
            .expect("add");
    }

    // The backup serves the read from the master's state, whether or not
    // replication has caught up locally.
    let entries = backup.flow_entries().await.expect("forwarded read");
    assert_eq!(entries.len(), 3);
}

#[tokio::test]
async fn failover_queues_writes_until_the_new_term_is_synchronized() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let old_master = cluster.table(device, NodeId(1), fast_config());
    let new_master = cluster.table(device, NodeId(2), fast_config());

    let survivor = test_rule(device, 11, 1);
    old_master
        .add(test_entry(survivor.clone(), 100))
        .await
        .expect("add");
    eventually("entry to replicate to the backup", || {
        new_master.flow_entry(&survivor).is_some()
    })
    .await;

    // The old master dies; its backup is promoted for term 2. The
    // promotion cannot reach the dead node, so activation waits out the
    // synchronization timeout before falling back.
    cluster.partition(NodeId(1));
    cluster.set_replicas(device, 2, Some(NodeId(2)), Vec::new());
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Submitted while term 2 is still synchronizing: parked, not lost.
    let queued = test_rule(device, 12, 1);
    new_master
        .add(test_entry(queued.clone(), 200))
        .await
        .expect("queued add completes after activation");

    assert!(new_master.flow_entry(&survivor).is_some());
    assert!(new_master.flow_entry(&queued).is_some());
    assert_eq!(new_master.count(), 2);

    // The deposed master has learned about term 2 and refuses writes.
    let error = old_master
        .add(test_entry(test_rule(device, 13, 1), 300))
        .await
        .expect_err("write on deposed master");
    assert!(matches!(error.current_context(), TableError::NotMaster(_)));
}

#[tokio::test]
async fn new_master_pulls_state_from_the_prior_master() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), Vec::new());

    let old_master = cluster.table(device, NodeId(1), fast_config());
    let new_master = cluster.table(device, NodeId(2), fast_config());

    let rule = test_rule(device, 21, 1);
    old_master
        .add(test_entry(rule.clone(), 100))
        .await
        .expect("add");

    // Mastership moves while the prior master is still reachable: the
    // new master synchronizes directly from it.
    cluster.set_replicas(device, 2, Some(NodeId(2)), vec![NodeId(1)]);

    eventually("new master to pull state from the prior master", || {
        new_master.flow_entry(&rule).is_some()
    })
    .await;
    assert_eq!(new_master.count(), 1);
}

#[tokio::test]
async fn promoted_node_recovers_state_from_a_prior_backup() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(3)]);

    let old_master = cluster.table(device, NodeId(1), fast_config());
    let promoted = cluster.table(device, NodeId(2), fast_config());
    let prior_backup = cluster.table(device, NodeId(3), fast_config());

    let rule = test_rule(device, 17, 1);
    old_master
        .add(test_entry(rule.clone(), 100))
        .await
        .expect("add");
    eventually("entry to replicate to the backup", || {
        prior_backup.flow_entry(&rule).is_some()
    })
    .await;

    // The master dies and a node that held no replica is promoted. It
    // cannot reach the prior master, so it must recover the state from
    // the prior backup before activating.
    cluster.partition(NodeId(1));
    cluster.set_replicas(device, 2, Some(NodeId(2)), vec![NodeId(3)]);

    eventually("promoted node to recover state from the prior backup", || {
        promoted.flow_entry(&rule).is_some()
    })
    .await;
    assert_eq!(promoted.count(), 1);
}

#[tokio::test]
async fn first_assignment_activates_without_synchronization() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);

    // The tables exist before the device is ever assigned.
    let master = cluster.table(device, NodeId(1), fast_config());
    let backup = cluster.table(device, NodeId(2), fast_config());
    assert_eq!(master.count(), 0);

    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    // The assignment propagates through the feed asynchronously, so
    // retry past transient rejections. With no previous term there is
    // no state to recover, and the write completes well before the
    // synchronization timeout could have elapsed.
    let rule = test_rule(device, 9, 1);
    let entry = test_entry(rule.clone(), 100);
    tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match master.add(entry.clone()).await {
                Ok(()) => break,
                Err(error) if matches!(error.current_context(), TableError::NotMaster(_)) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(error) => panic!("add failed: {error:?}"),
            }
        }
    })
    .await
    .expect("activation without waiting on a prior term");

    assert_eq!(master.count(), 1);
    eventually("entry to replicate to the backup", || {
        backup.flow_entry(&rule).is_some()
    })
    .await;
}

#[tokio::test]
async fn anti_entropy_repairs_a_backup_that_lost_its_state() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let master = cluster.table(device, NodeId(1), fast_config());
    let backup = cluster.table(device, NodeId(2), fast_config());

    let rule = test_rule(device, 33, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");
    eventually("entry to replicate to the backup", || {
        backup.flow_entry(&rule).is_some()
    })
    .await;

    // The backup restarts empty. The master believes it is up to date,
    // so only the digest comparison can notice the divergence and force
    // a re-push.
    backup.close();
    drop(backup);
    let restarted = cluster.table(device, NodeId(2), fast_config());
    assert_eq!(restarted.count(), 0);

    eventually("anti-entropy to restore the lost bucket", || {
        restarted.flow_entry(&rule).is_some()
    })
    .await;
}

#[tokio::test]
async fn unchanged_buckets_are_not_backed_up_again() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    // Anti-entropy disabled for the duration of the test; only the
    // periodic push is running.
    let config = TableConfig {
        backup_period: Duration::from_millis(25),
        anti_entropy_period: Duration::from_secs(600),
        sync_timeout: Duration::from_millis(250),
    };
    let master = cluster.table(device, NodeId(1), config);
    let backup = cluster.table(device, NodeId(2), config);

    let rule = test_rule(device, 5, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");
    eventually("entry to replicate to the backup", || {
        backup.flow_entry(&rule).is_some()
    })
    .await;

    // Many periods later, the unchanged bucket has still only been
    // pushed once.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.backups_delivered(device, NodeId(2)), 1);

    // A new write to the same bucket triggers exactly one more push.
    let mut touched = test_entry(rule.clone(), 100);
    touched.state = FlowState::Added;
    master.update(touched).await.expect("update");
    eventually("updated entry to replicate", || {
        backup
            .flow_entry(&rule)
            .is_some_and(|entry| entry.state == FlowState::Added)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.backups_delivered(device, NodeId(2)), 2);
}

#[tokio::test]
async fn purge_empties_the_local_table() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), Vec::new());
    let master = cluster.table(device, NodeId(1), fast_config());

    for flow in [1, 2, 3] {
        master
            .add(test_entry(test_rule(device, flow, 1), 100))
            .await
            .expect("add");
    }
    assert_eq!(master.count(), 3);

    master.purge();
    assert_eq!(master.count(), 0);
}

#[tokio::test]
async fn purge_app_removes_only_that_application() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let master = cluster.table(device, NodeId(1), fast_config());
    let backup = cluster.table(device, NodeId(2), fast_config());

    let fwd = test_rule(device, 1, 1);
    let lb = test_rule(device, 2, 2);
    master.add(test_entry(fwd.clone(), 100)).await.expect("add");
    master.add(test_entry(lb.clone(), 100)).await.expect("add");
    eventually("entries to replicate to the backup", || backup.count() == 2).await;

    master.purge_app(AppId(1)).await.expect("purge_app");
    assert_eq!(master.count(), 1);
    assert!(master.flow_entry(&fwd).is_none());
    assert!(master.flow_entry(&lb).is_some());

    // The purge is a versioned mutation, so it replicates like any write.
    eventually("purge to replicate to the backup", || {
        backup.flow_entry(&fwd).is_none()
    })
    .await;
    assert!(backup.flow_entry(&lb).is_some());
}

#[tokio::test]
async fn nodes_dropped_from_the_replica_set_clear_their_state() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2)]);

    let master = cluster.table(device, NodeId(1), fast_config());
    let dropped = cluster.table(device, NodeId(2), fast_config());

    let rule = test_rule(device, 8, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");
    eventually("entry to replicate to the backup", || {
        dropped.flow_entry(&rule).is_some()
    })
    .await;

    // Term 2 keeps the master but drops the backup entirely. Once the
    // term activates, the dropped node must not retain device state.
    cluster.set_replicas(device, 2, Some(NodeId(1)), Vec::new());

    eventually("dropped replica to clear its state", || dropped.count() == 0).await;
    assert_eq!(master.count(), 1);
}

#[tokio::test]
async fn backups_dropped_within_a_term_clear_their_state() {
    init_tracing();

    let cluster = LocalCluster::new();
    let device = DeviceId(1);
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(2), NodeId(3)]);

    // The master is built last so its activation reaches both backups.
    let dropped = cluster.table(device, NodeId(2), fast_config());
    let kept = cluster.table(device, NodeId(3), fast_config());
    let master = cluster.table(device, NodeId(1), fast_config());

    let rule = test_rule(device, 3, 1);
    master.add(test_entry(rule.clone(), 100)).await.expect("add");
    eventually("entry to replicate to both backups", || {
        dropped.flow_entry(&rule).is_some() && kept.flow_entry(&rule).is_some()
    })
    .await;

    // The master keeps its term but sheds one node from the backup
    // set; the dropped node must not retain device state.
    cluster.set_replicas(device, 1, Some(NodeId(1)), vec![NodeId(3)]);

    eventually("dropped backup to clear its state", || dropped.count() == 0).await;
    assert_eq!(master.count(), 1);
    assert!(kept.flow_entry(&rule).is_some());
}
