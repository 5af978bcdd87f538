//! Shard records in topology, and the replication-graph traversals used by
//! rebuilds, reparents, and validation.

use std::collections::HashMap;

use oxherd_agent::records::{read_tablet, TabletInfo};
use oxherd_common::{Keyspace, KeyspaceShard, Shard, ShardInfo, TabletAlias};
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_topo::{ensure_path, CreateMode, NodeVersion, TopoConn, TopoConnExt};

/// Read a shard record with the version to write back at.
pub async fn read_shard(
    conn: &dyn TopoConn,
    keyspace: &str,
    shard: &str,
) -> OxherdResult<(ShardInfo, NodeVersion)> {
    let path = paths::shard_path(keyspace, shard);
    let (record, version) = conn.get_json::<Shard>(&path).await?;
    Ok((ShardInfo::new(keyspace, shard, record), version))
}

/// Write back a shard record read earlier.
pub async fn update_shard(
    conn: &dyn TopoConn,
    info: &ShardInfo,
    expected: NodeVersion,
) -> OxherdResult<NodeVersion> {
    let path = paths::shard_path(info.keyspace(), info.shard_name());
    conn.set_json(&path, &info.shard, Some(expected)).await
}

/// Create a shard record plus its action and actionlog queues.
pub async fn create_shard(
    conn: &dyn TopoConn,
    keyspace: &str,
    shard: &str,
    record: Shard,
) -> OxherdResult<()> {
    ensure_path(conn, &paths::shards_path(keyspace)).await?;
    let path = paths::shard_path(keyspace, shard);
    let data = serde_json::to_vec_pretty(&record)?;
    match conn.create(&path, data, CreateMode::Persistent).await {
        Ok(_) => {}
        Err(OxherdError::NodeExists(_)) => {
            conn.set(&path, serde_json::to_vec_pretty(&record)?, None)
                .await?;
        }
        Err(e) => return Err(e),
    }
    for child in ["action", "actionlog"] {
        match conn
            .create(&format!("{path}/{child}"), Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(OxherdError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// All tablet aliases reachable through the shard's replication graph:
/// masters at the root, slaves nested under them. Non-alias children (the
/// action queues, lock nodes) are skipped.
pub async fn find_all_tablet_aliases_in_shard(
    conn: &dyn TopoConn,
    keyspace: &str,
    shard: &str,
) -> OxherdResult<Vec<TabletAlias>> {
    let root = paths::shard_replication_root(keyspace, shard);
    let mut aliases = Vec::new();
    for relative in conn.children_recursive(&root).await? {
        // The action queues share the shard node with the graph.
        let first = relative.split('/').next().unwrap_or(&relative);
        if first == "action" || first == "actionlog" {
            continue;
        }
        let leaf = relative.rsplit('/').next().unwrap_or(&relative);
        if let Ok(alias) = leaf.parse::<TabletAlias>() {
            aliases.push(alias);
        }
    }
    aliases.sort();
    aliases.dedup();
    Ok(aliases)
}

/// Read every graph member's tablet record, keyed by alias. Tablets that
/// vanish mid-read are skipped (another process may be deleting nodes).
pub async fn tablet_map_for_shard(
    conn: &dyn TopoConn,
    keyspace: &str,
    shard: &str,
) -> OxherdResult<HashMap<TabletAlias, TabletInfo>> {
    let mut map = HashMap::new();
    for alias in find_all_tablet_aliases_in_shard(conn, keyspace, shard).await? {
        match read_tablet(conn, &paths::tablet_path(&alias)).await {
            Ok(info) => {
                map.insert(alias, info);
            }
            Err(OxherdError::NodeNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(map)
}

/// Split a tablet map into the slaves plus the current master, as recorded
/// in the tablet records themselves (the master is the one with no parent).
pub fn slave_tablet_map(
    tablet_map: &HashMap<TabletAlias, TabletInfo>,
) -> OxherdResult<(HashMap<TabletAlias, TabletInfo>, Option<TabletInfo>)> {
    let mut slaves = HashMap::new();
    let mut master: Option<TabletInfo> = None;
    for (alias, info) in tablet_map {
        if info.tablet.parent.is_none() {
            if let Some(existing) = &master {
                return Err(OxherdError::Aborted(format!(
                    "tablet map has two masters: {} and {}",
                    existing.alias(),
                    alias
                )));
            }
            master = Some(info.clone());
        } else {
            slaves.insert(alias.clone(), info.clone());
        }
    }
    Ok((slaves, master))
}

/// Recompute the shard record from the replication graph and write it back.
pub async fn rebuild_shard(
    conn: &dyn TopoConn,
    keyspace: &str,
    shard: &str,
) -> OxherdResult<ShardInfo> {
    let (mut info, version) = read_shard(conn, keyspace, shard).await?;
    let tablet_map = tablet_map_for_shard(conn, keyspace, shard).await?;
    let tablets: Vec<_> = tablet_map.values().map(|i| i.tablet.clone()).collect();
    info.rebuild(&tablets)?;
    update_shard(conn, &info, version).await?;
    Ok(info)
}

/// Recompute the keyspace record from its shards, checking the partition.
pub async fn rebuild_keyspace(conn: &dyn TopoConn, keyspace: &str) -> OxherdResult<Keyspace> {
    let shards_path = paths::shards_path(keyspace);
    let mut shards = Vec::new();
    for name in conn.children(&shards_path).await? {
        let (info, _) = read_shard(conn, keyspace, &name).await?;
        shards.push(KeyspaceShard {
            name,
            key_range: info.shard.key_range.clone(),
        });
    }
    let record = Keyspace { shards };
    record.check_partition()?;
    conn.set_json(&paths::keyspace_path(keyspace), &record, None)
        .await?;
    Ok(record)
}
