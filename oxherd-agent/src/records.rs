//! Tablet records in topology: read, update, create, and the state
//! transitions that can be applied directly.

use oxherd_common::{is_trivial_type_change, Tablet, TabletAlias, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_topo::{ensure_path, CreateMode, NodeVersion, TopoConn, TopoConnExt};
use tracing::{debug, warn};

/// A tablet record together with the path and version it was read at, so
/// updates are compare-and-swap.
#[derive(Clone, Debug)]
pub struct TabletInfo {
    path: String,
    version: NodeVersion,
    pub tablet: Tablet,
}

impl TabletInfo {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn alias(&self) -> TabletAlias {
        self.tablet.alias()
    }

    pub fn shard_path(&self) -> String {
        paths::shard_path(&self.tablet.keyspace, &self.tablet.shard)
    }

    /// Absolute replication-graph path for this tablet.
    pub fn replication_path(&self) -> String {
        format!(
            "{}/{}",
            paths::shard_replication_root(&self.tablet.keyspace, &self.tablet.shard),
            self.tablet.replication_path()
        )
    }
}

/// Read a tablet record.
pub async fn read_tablet(conn: &dyn TopoConn, tablet_path: &str) -> OxherdResult<TabletInfo> {
    let (tablet, version) = conn.get_json::<Tablet>(tablet_path).await?;
    Ok(TabletInfo {
        path: tablet_path.to_owned(),
        version,
        tablet,
    })
}

/// Write back a tablet record read earlier. Fails with `VersionMismatch`
/// if someone else wrote in between.
pub async fn update_tablet(conn: &dyn TopoConn, info: &mut TabletInfo) -> OxherdResult<()> {
    let version = conn
        .set_json(&info.path, &info.tablet, Some(info.version))
        .await?;
    info.version = version;
    Ok(())
}

/// Create a tablet record along with its queue, log, and (when it belongs
/// to a shard) replication-graph nodes.
pub async fn create_tablet(conn: &dyn TopoConn, tablet: &Tablet) -> OxherdResult<String> {
    let alias = tablet.alias();
    let tablet_path = paths::tablet_path(&alias);
    ensure_path(conn, &paths::tablets_path(&alias.cell)).await?;
    let data = serde_json::to_vec_pretty(tablet)?;
    conn.create(&tablet_path, data, CreateMode::Persistent).await?;
    conn.create(
        &paths::tablet_action_path(&alias),
        Vec::new(),
        CreateMode::Persistent,
    )
    .await?;
    conn.create(
        &paths::tablet_actionlog_path(&alias),
        Vec::new(),
        CreateMode::Persistent,
    )
    .await?;
    if tablet.is_in_replication_graph() && !tablet.keyspace.is_empty() {
        create_replication_path(conn, tablet).await?;
    }
    Ok(tablet_path)
}

/// Materialize the tablet's replication-graph node (and any missing
/// ancestors). Already-present nodes are fine.
pub async fn create_replication_path(conn: &dyn TopoConn, tablet: &Tablet) -> OxherdResult<()> {
    let path = format!(
        "{}/{}",
        paths::shard_replication_root(&tablet.keyspace, &tablet.shard),
        tablet.replication_path()
    );
    ensure_path(conn, &path).await
}

/// Remove the tablet's replication-graph node. Missing nodes are fine;
/// `NotEmpty` propagates (a master with attached slaves cannot quietly
/// leave the graph).
pub async fn delete_replication_path(conn: &dyn TopoConn, tablet: &Tablet) -> OxherdResult<()> {
    let path = format!(
        "{}/{}",
        paths::shard_replication_root(&tablet.keyspace, &tablet.shard),
        tablet.replication_path()
    );
    match conn.delete(&path, None).await {
        Ok(()) | Err(OxherdError::NodeNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Scrap a tablet: mark it terminal and pull it out of the replication
/// graph. With `force`, also purge its pending actions and squelch the
/// not-empty case for a forced master scrap.
pub async fn scrap(conn: &dyn TopoConn, tablet_path: &str, force: bool) -> OxherdResult<()> {
    let mut info = read_tablet(conn, tablet_path).await?;
    let was_idle = info.tablet.tablet_type == TabletType::Idle;
    let was_master = info.tablet.parent.is_none();
    let replication_path = info.replication_path();

    info.tablet.tablet_type = TabletType::Scrap;
    info.tablet.parent = None;
    // The tablet record is canonical; update it first.
    update_tablet(conn, &mut info).await?;

    if force {
        let action_path = paths::tablet_action_path(&info.alias());
        if let Err(e) = purge_actions(conn, &action_path).await {
            warn!(%action_path, %e, "purge actions failed");
        }
    }

    if !was_idle {
        match conn.delete(&replication_path, None).await {
            Ok(()) => {}
            Err(OxherdError::NodeNotFound(_)) => {
                debug!(%replication_path, "no replication path");
            }
            Err(OxherdError::NotEmpty(_)) if was_master && force => {
                // A forced master scrap leaves slaves pointing at the dead
                // master; the graph gets fixed by the next reparent.
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Delete every queued action under `action_path`.
pub async fn purge_actions(conn: &dyn TopoConn, action_path: &str) -> OxherdResult<()> {
    for child in conn.children(action_path).await? {
        conn.delete(&format!("{action_path}/{child}"), None).await?;
    }
    Ok(())
}

/// Apply a type change directly, enforcing the trivial-transition rules.
/// Moving to idle clears the shard assignment, which is only legal once the
/// reparent that drained the tablet has finished.
pub async fn change_type(
    conn: &dyn TopoConn,
    tablet_path: &str,
    new_type: TabletType,
) -> OxherdResult<()> {
    let mut info = read_tablet(conn, tablet_path).await?;
    if !is_trivial_type_change(info.tablet.tablet_type, new_type) {
        return Err(OxherdError::Aborted(format!(
            "cannot change tablet type {} -> {} for {tablet_path}",
            info.tablet.tablet_type, new_type
        )));
    }

    let old_replication_path = info.replication_path();
    info.tablet.tablet_type = new_type;
    if new_type == TabletType::Idle {
        if info.tablet.parent.is_none() {
            let stat = conn.exists(&old_replication_path).await?;
            if let Some(stat) = stat {
                if stat.num_children != 0 {
                    return Err(OxherdError::Aborted(format!(
                        "cannot change tablet type to idle: reparent has not finished for {tablet_path}"
                    )));
                }
            }
        }
        info.tablet.clear_assignment();
    }
    update_tablet(conn, &mut info).await
}

/// Register the agent's liveness node.
pub async fn register_pid(conn: &dyn TopoConn, alias: &TabletAlias) -> OxherdResult<()> {
    let pid_path = paths::tablet_pid_path(alias);
    match conn
        .create(
            &pid_path,
            std::process::id().to_string().into_bytes(),
            CreateMode::Ephemeral,
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(OxherdError::NodeExists(_)) => Err(OxherdError::Aborted(format!(
            "another agent holds the pid node {pid_path}"
        ))),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use oxherd_common::{KeyRange, TabletState};
    use oxherd_topo::MemoryTopo;

    use super::*;

    fn tablet(uid: u32, tablet_type: TabletType, parent: Option<TabletAlias>) -> Tablet {
        Tablet {
            cell: "nyc".into(),
            uid,
            parent,
            addr: format!("host{uid}:8080"),
            mysql_addr: format!("host{uid}:3306"),
            mysql_ip_addr: format!("10.0.0.{uid}:3306"),
            keyspace: "test_keyspace".into(),
            shard: "0".into(),
            tablet_type,
            state: TabletState::ReadOnly,
            key_range: KeyRange::all(),
        }
    }

    async fn setup_shard(conn: &dyn TopoConn) {
        ensure_path(conn, &paths::shard_path("test_keyspace", "0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_read_update_tablet() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        setup_shard(&conn).await;

        let master = tablet(1, TabletType::Master, None);
        let path = create_tablet(&conn, &master).await.unwrap();

        let mut info = read_tablet(&conn, &path).await.unwrap();
        assert_eq!(info.tablet, master);
        info.tablet.state = TabletState::ReadWrite;
        update_tablet(&conn, &mut info).await.unwrap();

        // A stale copy loses the CAS.
        let mut stale = read_tablet(&conn, &path).await.unwrap();
        let mut racing = read_tablet(&conn, &path).await.unwrap();
        update_tablet(&conn, &mut racing).await.unwrap();
        stale.tablet.state = TabletState::ReadOnly;
        assert!(matches!(
            update_tablet(&conn, &mut stale).await,
            Err(OxherdError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn scrap_removes_tablet_from_graph() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        setup_shard(&conn).await;

        let master = tablet(1, TabletType::Master, None);
        create_tablet(&conn, &master).await.unwrap();
        let slave = tablet(2, TabletType::Replica, Some(master.alias()));
        let slave_path = create_tablet(&conn, &slave).await.unwrap();

        let info = read_tablet(&conn, &slave_path).await.unwrap();
        let replication_path = info.replication_path();
        assert!(conn.exists(&replication_path).await.unwrap().is_some());

        scrap(&conn, &slave_path, false).await.unwrap();
        let info = read_tablet(&conn, &slave_path).await.unwrap();
        assert_eq!(info.tablet.tablet_type, TabletType::Scrap);
        assert!(info.tablet.parent.is_none());
        assert!(conn.exists(&replication_path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn change_type_enforces_trivial_transitions() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        setup_shard(&conn).await;

        let master = tablet(1, TabletType::Master, None);
        create_tablet(&conn, &master).await.unwrap();
        let slave = tablet(2, TabletType::Replica, Some(master.alias()));
        let slave_path = create_tablet(&conn, &slave).await.unwrap();

        change_type(&conn, &slave_path, TabletType::Spare)
            .await
            .unwrap();
        assert!(matches!(
            change_type(&conn, &slave_path, TabletType::Master).await,
            Err(OxherdError::Aborted(_))
        ));
    }
}
