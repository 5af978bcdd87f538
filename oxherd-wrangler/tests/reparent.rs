//! Reparent flows against an in-process cluster of agents.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Cluster, KEYSPACE, SHARD};
use oxherd_agent::mysql::PromotionData;
use oxherd_agent::records::read_tablet;
use oxherd_common::TabletType;
use oxherd_errors::OxherdError;
use oxherd_topo::paths;
use oxherd_wrangler::shards::{read_shard, rebuild_shard};
use oxherd_wrangler::Wrangler;
use replication_position::ReplicationPosition;

fn wrangler(cluster: &Cluster) -> Wrangler {
    Wrangler::new(Arc::clone(&cluster.conn), Duration::from_secs(15))
}

#[tokio::test]
async fn internal_reparent_promotes_elect_and_restarts_the_rest() {
    let mut cluster = Cluster::new().await;
    let t1 = cluster.add_tablet(1, TabletType::Master, None).await;
    let master = cluster.tablet(t1).tablet.clone();
    let t2 = cluster.add_tablet(2, TabletType::Replica, Some(&master)).await;
    let t3 = cluster.add_tablet(3, TabletType::Replica, Some(&master)).await;

    rebuild_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();

    cluster.tablet(t1).mysql.set_master_position(ReplicationPosition {
        master_log_file: "vt-bin.000013".into(),
        master_log_position: 4242,
        seconds_behind_master: 0,
    });
    cluster.tablet(t2).mysql.set_promotion(PromotionData::default());

    let elect_path = cluster.tablet(t2).path.clone();
    wrangler(&cluster)
        .reparent_shard(KEYSPACE, SHARD, &elect_path)
        .await
        .unwrap();

    let (shard_info, _) = read_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();
    assert_eq!(
        shard_info.shard.master_alias,
        Some(cluster.tablet(t2).alias())
    );
    let mut replicas = shard_info.shard.replica_aliases.clone();
    replicas.sort();
    assert_eq!(
        replicas,
        vec![cluster.tablet(t1).alias(), cluster.tablet(t3).alias()]
    );

    // The old master was demoted and reattached under the new one.
    let old = read_tablet(cluster.conn.as_ref(), &cluster.tablet(t1).path)
        .await
        .unwrap();
    assert_eq!(old.tablet.tablet_type, TabletType::Replica);
    assert_eq!(old.tablet.parent, Some(cluster.tablet(t2).alias()));
    assert!(cluster.tablet(t1).mysql.calls().contains(&"demote_master".into()));
    assert!(cluster.tablet(t2).mysql.calls().contains(&"promote_slave".into()));
    assert!(cluster.tablet(t3).mysql.calls().contains(&"restart_slave".into()));

    // The promotion scratch data was retired; a later reparent can run.
    let scratch = format!(
        "{}/restart_slave_data",
        paths::shard_action_path(KEYSPACE, SHARD)
    );
    assert!(cluster.conn.exists(&scratch).await.unwrap().is_none());
    // And the lock is free again.
    let lock = format!("{}/lock", paths::shard_action_path(KEYSPACE, SHARD));
    assert!(cluster.conn.exists(&lock).await.unwrap().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn external_reparent_reconciles_topology() {
    let mut cluster = Cluster::new().await;
    let t1 = cluster.add_tablet(1, TabletType::Master, None).await;
    let master = cluster.tablet(t1).tablet.clone();
    let t2 = cluster.add_tablet(2, TabletType::Replica, Some(&master)).await;
    let t3 = cluster.add_tablet(3, TabletType::Replica, Some(&master)).await;

    rebuild_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();

    // The external actor already repointed everything at t2.
    let new_master_addr = cluster.tablet(t2).tablet.mysql_addr.clone();
    cluster.tablet(t2).mysql.set_is_master(true);
    cluster.tablet(t1).mysql.set_master_addr(new_master_addr.clone());
    cluster.tablet(t3).mysql.set_master_addr(new_master_addr);

    let elect_path = cluster.tablet(t2).path.clone();
    wrangler(&cluster)
        .shard_externally_reparented(KEYSPACE, SHARD, &elect_path, false)
        .await
        .unwrap();

    let (shard_info, _) = read_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();
    assert_eq!(
        shard_info.shard.master_alias,
        Some(cluster.tablet(t2).alias())
    );
    let mut replicas = shard_info.shard.replica_aliases.clone();
    replicas.sort();
    assert_eq!(
        replicas,
        vec![cluster.tablet(t1).alias(), cluster.tablet(t3).alias()]
    );

    // Both old members were told the slave was restarted.
    assert!(cluster.tablet(t1).mysql.calls().contains(&"master_addr".into()));
    assert!(cluster.tablet(t3).mysql.calls().contains(&"master_addr".into()));

    // The lock is released.
    let lock = format!("{}/lock", paths::shard_action_path(KEYSPACE, SHARD));
    assert!(cluster.conn.exists(&lock).await.unwrap().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn external_reparent_aborts_when_promotion_is_not_confirmed() {
    let mut cluster = Cluster::new().await;
    let t1 = cluster.add_tablet(1, TabletType::Master, None).await;
    let master = cluster.tablet(t1).tablet.clone();
    let t2 = cluster.add_tablet(2, TabletType::Replica, Some(&master)).await;
    let t3 = cluster.add_tablet(3, TabletType::Replica, Some(&master)).await;

    rebuild_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();

    // t2 does not actually believe it is master.
    cluster.tablet(t2).mysql.set_is_master(false);

    let elect_path = cluster.tablet(t2).path.clone();
    let err = wrangler(&cluster)
        .shard_externally_reparented(KEYSPACE, SHARD, &elect_path, false)
        .await
        .unwrap_err();
    assert!(matches!(err, OxherdError::Aborted(_)), "got {err:?}");

    // Shard record unchanged, no slave was touched, lock released.
    let (shard_info, _) = read_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();
    assert_eq!(
        shard_info.shard.master_alias,
        Some(cluster.tablet(t1).alias())
    );
    assert!(!cluster.tablet(t1).mysql.calls().contains(&"master_addr".into()));
    assert!(!cluster.tablet(t3).mysql.calls().contains(&"master_addr".into()));
    let lock = format!("{}/lock", paths::shard_action_path(KEYSPACE, SHARD));
    assert!(cluster.conn.exists(&lock).await.unwrap().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn external_reparent_refuses_the_current_master() {
    let mut cluster = Cluster::new().await;
    let t1 = cluster.add_tablet(1, TabletType::Master, None).await;
    let master = cluster.tablet(t1).tablet.clone();
    let _t2 = cluster.add_tablet(2, TabletType::Replica, Some(&master)).await;

    // The shard record names t1 as master already.
    rebuild_shard(cluster.conn.as_ref(), KEYSPACE, SHARD)
        .await
        .unwrap();

    let err = wrangler(&cluster)
        .shard_externally_reparented(KEYSPACE, SHARD, &cluster.tablet(t1).path, false)
        .await
        .unwrap_err();
    assert!(matches!(err, OxherdError::Aborted(_)));

    cluster.shutdown().await;
}
