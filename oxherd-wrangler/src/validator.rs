//! Consistency checking between topology records and reality.
//!
//! Given the node counts are usually large, the work runs with as much
//! parallelism as is viable: per-shard tasks fan out per-tablet checks and
//! report every finding on one buffered channel. A deadline bounds the
//! whole run; when it fires mid-run the channel is drained non-blockingly
//! so nothing deadlocks behind an abandoned receiver.

use std::collections::HashMap;
use std::sync::Arc;

use oxherd_agent::actionnode::ActionReply;
use oxherd_agent::records::{read_tablet, TabletInfo};
use oxherd_common::TabletAlias;
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_topo::TopoConn;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::shards;
use crate::wrangler::Wrangler;

struct VResult {
    path: String,
    result: OxherdResult<()>,
}

type Results = mpsc::Sender<VResult>;

async fn send_result(results: &Results, path: impl Into<String>, result: OxherdResult<()>) {
    let _ = results
        .send(VResult {
            path: path.into(),
            result,
        })
        .await;
}

/// Check one tablet's own record against its replication-graph node. With
/// an expected path, the tablet must sit exactly there.
async fn validate_tablet(
    conn: &dyn TopoConn,
    tablet_path: &str,
    expected_replication_path: Option<&str>,
) -> OxherdResult<()> {
    let info = read_tablet(conn, tablet_path).await?;

    if !info.tablet.is_in_replication_graph() {
        return Ok(());
    }
    let replication_path = info.replication_path();
    if let Some(expected) = expected_replication_path {
        if replication_path != expected {
            return Err(OxherdError::Aborted(format!(
                "tablet {tablet_path} replication path {replication_path} does not match graph position {expected}"
            )));
        }
    }
    if conn.exists(&replication_path).await?.is_none() {
        return Err(OxherdError::Aborted(format!(
            "tablet {tablet_path} missing replication-graph node {replication_path}"
        )));
    }
    Ok(())
}

impl Wrangler {
    /// Validate the whole topology tree: every tablet in every cell, then
    /// the replication graph of every keyspace.
    pub async fn validate(&self, ping_tablets: bool) -> OxherdResult<()> {
        let (tx, rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();

        let conn = Arc::clone(self.conn());
        let timeout = self.action_timeout();
        let initiator = self.initiator().clone();
        tokio::spawn(async move {
            let mut tasks = Vec::new();
            {
                let conn = Arc::clone(&conn);
                let tx = tx.clone();
                tasks.push(tokio::spawn(async move {
                    validate_all_tablets(conn, tx).await;
                }));
            }

            match conn.children(paths::GLOBAL_KEYSPACES).await {
                Ok(keyspaces) => {
                    for keyspace in keyspaces {
                        let conn = Arc::clone(&conn);
                        let tx = tx.clone();
                        let initiator = initiator.clone();
                        tasks.push(tokio::spawn(async move {
                            validate_keyspace_inner(
                                conn, initiator, timeout, &keyspace, ping_tablets, tx,
                            )
                            .await;
                        }));
                    }
                }
                Err(e) => {
                    send_result(&tx, paths::GLOBAL_KEYSPACES, Err(e)).await;
                }
            }
            drop(tx);
            for task in tasks {
                let _ = task.await;
            }
            let _ = done_tx.send(());
        });

        self.wait_for_results(rx, done_rx).await
    }

    /// Validate one keyspace's replication graph.
    pub async fn validate_keyspace(
        &self,
        keyspace: &str,
        ping_tablets: bool,
    ) -> OxherdResult<()> {
        let (tx, rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();
        let conn = Arc::clone(self.conn());
        let initiator = self.initiator().clone();
        let timeout = self.action_timeout();
        let keyspace = keyspace.to_owned();
        tokio::spawn(async move {
            validate_keyspace_inner(conn, initiator, timeout, &keyspace, ping_tablets, tx).await;
            let _ = done_tx.send(());
        });
        self.wait_for_results(rx, done_rx).await
    }

    /// Validate one shard.
    pub async fn validate_shard(
        &self,
        keyspace: &str,
        shard: &str,
        ping_tablets: bool,
    ) -> OxherdResult<()> {
        let (tx, rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();
        let conn = Arc::clone(self.conn());
        let initiator = self.initiator().clone();
        let timeout = self.action_timeout();
        let keyspace = keyspace.to_owned();
        let shard = shard.to_owned();
        tokio::spawn(async move {
            validate_shard_inner(conn, initiator, timeout, &keyspace, &shard, ping_tablets, tx)
                .await;
            let _ = done_tx.send(());
        });
        self.wait_for_results(rx, done_rx).await
    }

    /// Collect results until all checks finish or the deadline fires. On
    /// deadline, the channel is drained without blocking before returning,
    /// so in-flight senders never wedge.
    async fn wait_for_results(
        &self,
        mut results: mpsc::Receiver<VResult>,
        mut done: oneshot::Receiver<()>,
    ) -> OxherdResult<()> {
        let deadline = tokio::time::sleep(self.action_timeout());
        tokio::pin!(deadline);

        let mut some_errors = false;
        let mut record = |v: VResult| {
            info!(path = %v.path, "checking");
            if let Err(e) = v.result {
                some_errors = true;
                error!(path = %v.path, %e, "validation failed");
            }
        };

        loop {
            tokio::select! {
                received = results.recv() => {
                    match received {
                        Some(v) => record(v),
                        None => break,
                    }
                }
                _ = &mut done => {
                    // Prevent false positives: drain completely once done.
                    while let Ok(v) = results.try_recv() {
                        record(v);
                    }
                    break;
                }
                _ = &mut deadline => {
                    while let Ok(v) = results.try_recv() {
                        record(v);
                    }
                    return Err(OxherdError::Timeout {
                        during: "validate".into(),
                    });
                }
            }
        }

        if some_errors {
            return Err(OxherdError::Partial {
                errors: "some validation errors - see log".into(),
            });
        }
        Ok(())
    }
}

/// Validate all tablets in all cells, even those not in the replication
/// graph.
async fn validate_all_tablets(conn: Arc<dyn TopoConn>, results: Results) {
    let cells = match discover_cells(conn.as_ref()).await {
        Ok(cells) => cells,
        Err(e) => {
            send_result(&results, "/", Err(e)).await;
            return;
        }
    };

    for cell in cells {
        let tablets_path = paths::tablets_path(&cell);
        match conn.children(&tablets_path).await {
            Ok(uids) => {
                let mut checks = Vec::new();
                for uid in uids {
                    let conn = Arc::clone(&conn);
                    let results = results.clone();
                    let tablet_path = format!("{tablets_path}/{uid}");
                    checks.push(tokio::spawn(async move {
                        let outcome = validate_tablet(conn.as_ref(), &tablet_path, None).await;
                        send_result(&results, tablet_path, outcome).await;
                    }));
                }
                for check in checks {
                    let _ = check.await;
                }
            }
            Err(e) => send_result(&results, tablets_path, Err(e)).await,
        }
    }
}

/// Cells are the top-level children of the namespace, minus the global
/// subtree.
async fn discover_cells(conn: &dyn TopoConn) -> OxherdResult<Vec<String>> {
    let mut cells = conn.children("/").await?;
    cells.retain(|c| c != "global");
    Ok(cells)
}

async fn validate_keyspace_inner(
    conn: Arc<dyn TopoConn>,
    initiator: oxherd_agent::ActionInitiator,
    timeout: std::time::Duration,
    keyspace: &str,
    ping_tablets: bool,
    results: Results,
) {
    // Walk the replication graph one shard at a time.
    let shards_path = paths::shards_path(keyspace);
    let shard_names = match conn.children(&shards_path).await {
        Ok(names) => names,
        Err(e) => {
            send_result(&results, shards_path, Err(e)).await;
            return;
        }
    };
    let mut tasks = Vec::new();
    for shard in shard_names {
        let conn = Arc::clone(&conn);
        let initiator = initiator.clone();
        let results = results.clone();
        let keyspace = keyspace.to_owned();
        tasks.push(tokio::spawn(async move {
            validate_shard_inner(conn, initiator, timeout, &keyspace, &shard, ping_tablets, results)
                .await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

async fn validate_shard_inner(
    conn: Arc<dyn TopoConn>,
    initiator: oxherd_agent::ActionInitiator,
    timeout: std::time::Duration,
    keyspace: &str,
    shard: &str,
    ping_tablets: bool,
    results: Results,
) {
    let shard_path = paths::shard_path(keyspace, shard);
    let shard_info = match shards::read_shard(conn.as_ref(), keyspace, shard).await {
        Ok((info, _)) => info,
        Err(e) => {
            send_result(&results, shard_path, Err(e)).await;
            return;
        }
    };

    let aliases = match shards::find_all_tablet_aliases_in_shard(conn.as_ref(), keyspace, shard)
        .await
    {
        Ok(aliases) => aliases,
        Err(e) => {
            send_result(&results, &shard_path, Err(e)).await;
            return;
        }
    };

    let tablet_map = match shards::tablet_map_for_shard(conn.as_ref(), keyspace, shard).await {
        Ok(map) => map,
        Err(e) => {
            send_result(&results, &shard_path, Err(e)).await;
            return;
        }
    };

    // The observed master is the unique graph member with no parent.
    let mut observed_master: Option<TabletAlias> = None;
    for alias in &aliases {
        let Some(info) = tablet_map.get(alias) else {
            send_result(
                &results,
                paths::tablet_path(alias),
                Err(OxherdError::Aborted(format!(
                    "tablet not found in map: {alias}"
                ))),
            )
            .await;
            continue;
        };
        if info.tablet.parent.is_none() {
            match &observed_master {
                Some(existing) => {
                    send_result(
                        &results,
                        paths::tablet_path(alias),
                        Err(OxherdError::Aborted(format!(
                            "{alias}: already has a master {existing}"
                        ))),
                    )
                    .await;
                }
                None => observed_master = Some(alias.clone()),
            }
        }
    }

    match &observed_master {
        None => {
            send_result(
                &results,
                &shard_path,
                Err(OxherdError::Aborted(format!(
                    "no master for shard {keyspace}/{shard}"
                ))),
            )
            .await;
        }
        Some(master) => {
            if shard_info.shard.master_alias.as_ref() != Some(master) {
                send_result(
                    &results,
                    &shard_path,
                    Err(OxherdError::Aborted(format!(
                        "master mismatch for shard {keyspace}/{shard}: found {master}, expected {}",
                        shard_info
                            .shard
                            .master_alias
                            .as_ref()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "none".to_owned())
                    ))),
                )
                .await;
            }

            let root = paths::shard_replication_root(keyspace, shard);
            let mut checks = Vec::new();
            for alias in &aliases {
                let expected = if alias == master {
                    format!("{root}/{master}")
                } else {
                    format!("{root}/{master}/{alias}")
                };
                let conn = Arc::clone(&conn);
                let results = results.clone();
                let tablet_path = paths::tablet_path(alias);
                checks.push(tokio::spawn(async move {
                    let outcome =
                        validate_tablet(conn.as_ref(), &tablet_path, Some(&expected)).await;
                    send_result(&results, expected, outcome).await;
                }));
            }
            for check in checks {
                let _ = check.await;
            }
        }
    }

    if ping_tablets {
        validate_replication(&initiator, timeout, &shard_info, &tablet_map, &results).await;
        ping_all_tablets(conn, initiator, timeout, &tablet_map, &results).await;
    }
}

/// Ask the master who its replicas are and cross-check both directions
/// against the replication graph, by IP.
async fn validate_replication(
    initiator: &oxherd_agent::ActionInitiator,
    timeout: std::time::Duration,
    shard_info: &oxherd_common::ShardInfo,
    tablet_map: &HashMap<TabletAlias, TabletInfo>,
    results: &Results,
) {
    let Some(master_alias) = shard_info.shard.master_alias.clone() else {
        send_result(
            results,
            format!("{}/{}", shard_info.keyspace(), shard_info.shard_name()),
            Err(OxherdError::Aborted("no master in shard record".into())),
        )
        .await;
        return;
    };
    let master_path = paths::tablet_path(&master_alias);
    if !tablet_map.contains_key(&master_alias) {
        send_result(
            results,
            master_path,
            Err(OxherdError::Aborted(format!(
                "master not in tablet map: {master_alias}"
            ))),
        )
        .await;
        return;
    }

    let slave_addrs = match initiator.get_slaves(&master_alias).await {
        Ok(path) => match initiator.wait_for_completion_reply(&path, timeout).await {
            Ok(ActionReply::Slaves(list)) => list.addrs,
            Ok(other) => {
                send_result(
                    results,
                    &master_path,
                    Err(OxherdError::Internal(format!(
                        "unexpected GetSlaves reply: {other:?}"
                    ))),
                )
                .await;
                return;
            }
            Err(e) => {
                send_result(results, &master_path, Err(e)).await;
                return;
            }
        },
        Err(e) => {
            send_result(results, &master_path, Err(e)).await;
            return;
        }
    };

    if slave_addrs.is_empty() {
        send_result(
            results,
            &master_path,
            Err(OxherdError::Aborted(format!(
                "no slaves found: {master_path}"
            ))),
        )
        .await;
        return;
    }

    // Addresses do not resolve the same everywhere; compare IPs only.
    let mut tablet_by_ip: HashMap<String, TabletAlias> = HashMap::new();
    for (alias, info) in tablet_map {
        match info.tablet.mysql_ip_addr.rsplit_once(':') {
            Some((ip, _)) => {
                tablet_by_ip.insert(ip.to_owned(), alias.clone());
            }
            None => {
                send_result(
                    results,
                    paths::tablet_path(alias),
                    Err(OxherdError::Aborted(format!(
                        "bad mysql addr: {}",
                        info.tablet.mysql_ip_addr
                    ))),
                )
                .await;
            }
        }
    }

    // Every connected replica must be in the graph.
    for addr in &slave_addrs {
        if !tablet_by_ip.contains_key(addr) {
            send_result(
                results,
                format!("{}/{}", shard_info.keyspace(), shard_info.shard_name()),
                Err(OxherdError::Aborted(format!(
                    "slave not in replication graph: {addr} (mysql instance without agent?)"
                ))),
            )
            .await;
        }
    }

    // Every graph slave must actually be attached.
    for (alias, info) in tablet_map {
        if !info.tablet.is_slave_type() {
            continue;
        }
        if let Some((ip, _)) = info.tablet.mysql_ip_addr.rsplit_once(':') {
            if !slave_addrs.iter().any(|a| a == ip) {
                send_result(
                    results,
                    paths::tablet_path(alias),
                    Err(OxherdError::Aborted(format!(
                        "slave not replicating: {alias} {ip}"
                    ))),
                )
                .await;
            }
        }
    }
}

/// Verify liveness: a pid node for every tablet, and a round-trip through
/// the action queue.
async fn ping_all_tablets(
    conn: Arc<dyn TopoConn>,
    initiator: oxherd_agent::ActionInitiator,
    timeout: std::time::Duration,
    tablet_map: &HashMap<TabletAlias, TabletInfo>,
    results: &Results,
) {
    let mut checks = Vec::new();
    for alias in tablet_map.keys() {
        let conn = Arc::clone(&conn);
        let initiator = initiator.clone();
        let results = results.clone();
        let alias = alias.clone();
        checks.push(tokio::spawn(async move {
            let tablet_path = paths::tablet_path(&alias);
            let pid_path = paths::tablet_pid_path(&alias);
            match conn.exists(&pid_path).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    send_result(
                        &results,
                        &tablet_path,
                        Err(OxherdError::Aborted(format!("no pid node {pid_path}"))),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    send_result(&results, &tablet_path, Err(e)).await;
                    return;
                }
            }

            let outcome = match initiator.ping(&alias).await {
                Ok(path) => initiator.wait_for_completion(&path, timeout).await,
                Err(e) => Err(e),
            };
            send_result(&results, tablet_path, outcome).await;
        }));
    }
    for check in checks {
        let _ = check.await;
    }
}
