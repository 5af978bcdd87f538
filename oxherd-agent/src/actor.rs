//! The actor applies individual commands to execute an action read from a
//! node in the topology store. Anything that modifies the state of a tablet
//! is applied by this code.
//!
//! The actor signals completion by writing a terminal copy of the node into
//! the action log and removing the queue node. Claiming is a
//! compare-and-swap on the queue node's version, so across crashes at most
//! one actor ever moves a given action from queued to running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use oxherd_common::{TabletAlias, TabletState, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_topo::{ensure_path, CreateMode, TopoConn, TopoConnExt};
use tracing::{error, info, warn};

use crate::actionnode::{
    ActionArgs, ActionKind, ActionNode, ActionReply, ActionState, PartialSnapshotArgs,
    RestartSlaveArgs, RestartSlaveData, RestoreArgs, SlaveList, SlaveWasRestartedArgs,
    SnapshotArgs, SnapshotReply, RESTART_SLAVE_DATA_NODE,
};
use crate::initiator::ActionInitiator;
use crate::manifest::{
    fetch_json, ManifestFetcher, SnapshotManifest, SplitSnapshotManifest,
    PARTIAL_SNAPSHOT_MANIFEST_FILE, SNAPSHOT_MANIFEST_FILE,
};
use crate::mysql::MysqlDriver;
use crate::records::{
    self, create_replication_path, delete_replication_path, read_tablet, update_tablet,
};

/// Executes actions against the local MySQL and the topology service.
pub struct TabletActor {
    conn: Arc<dyn TopoConn>,
    mysql: Arc<dyn MysqlDriver>,
    fetcher: Arc<dyn ManifestFetcher>,
    hooks_dir: PathBuf,
    /// How long to wait on an action another actor already claimed.
    claimed_wait_timeout: Duration,
}

impl TabletActor {
    pub fn new(
        conn: Arc<dyn TopoConn>,
        mysql: Arc<dyn MysqlDriver>,
        fetcher: Arc<dyn ManifestFetcher>,
        hooks_dir: PathBuf,
    ) -> Self {
        TabletActor {
            conn,
            mysql,
            fetcher,
            hooks_dir,
            claimed_wait_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_claimed_wait_timeout(mut self, timeout: Duration) -> Self {
        self.claimed_wait_timeout = timeout;
        self
    }

    /// Execute the action queued at `action_path`. `expected_action` and
    /// `expected_guid` guard against running a different node than the one
    /// the caller was told about.
    pub async fn handle_action(
        &self,
        action_path: &str,
        expected_action: ActionKind,
        expected_guid: &str,
        force_rerun: bool,
    ) -> OxherdResult<()> {
        let (data, version) = self.conn.get(action_path).await?;
        let text = String::from_utf8(data)
            .map_err(|e| OxherdError::Parse(format!("action node not utf-8: {e}")))?;
        let mut node = ActionNode::decode(&text)?;

        match node.state {
            ActionState::Running if !force_rerun => {
                // Another actor claimed it; most likely we restarted during
                // an action. Wait for its terminal record.
                warn!(%action_path, "waiting for running action");
                return self.wait_for_claimed(action_path).await;
            }
            ActionState::Failed => {
                // Legacy: new systems clean these out of the queue.
                return Err(OxherdError::ActionFailed {
                    path: action_path.to_owned(),
                    error: node.error,
                });
            }
            ActionState::Done => {
                return Err(OxherdError::Fatal(format!(
                    "unexpected finished action node in queue: {action_path}"
                )));
            }
            _ => {}
        }

        // Claim the action for this process.
        node.state = ActionState::Running;
        match self
            .conn
            .set(action_path, node.encode()?.into_bytes(), Some(version))
            .await
        {
            Ok(_) => {}
            Err(OxherdError::VersionMismatch { .. }) => {
                // Another actor won the claim. Just wait for completion.
                warn!(%action_path, "lost claim race, waiting for completion");
                return self.wait_for_claimed(action_path).await;
            }
            Err(e) => return Err(e),
        }

        info!(action = %node.action, %action_path, "claimed action");

        if node.action != expected_action || node.guid != expected_guid {
            error!(
                %action_path,
                found_action = %node.action,
                found_guid = %node.guid,
                "action validation failed"
            );
            return Err(OxherdError::Fatal(format!(
                "invalid action initiation: {expected_action} {expected_guid}"
            )));
        }

        let tablet_path = paths::target_path_for(action_path)?;
        let action_result = self.dispatch(&mut node, &tablet_path).await;
        store_action_response(self.conn.as_ref(), &mut node, action_path, &action_result).await?;

        // Remove from the queue on completion.
        self.conn.delete(action_path, None).await?;
        action_result
    }

    async fn wait_for_claimed(&self, action_path: &str) -> OxherdResult<()> {
        ActionInitiator::new(Arc::clone(&self.conn))
            .wait_for_completion(action_path, self.claimed_wait_timeout)
            .await
    }

    /// Run the handler for the node's action, converting panics into
    /// `Fatal` errors so one bad action cannot take the agent down.
    async fn dispatch(&self, node: &mut ActionNode, tablet_path: &str) -> OxherdResult<()> {
        let dispatched = std::panic::AssertUnwindSafe(self.dispatch_inner(node, tablet_path))
            .catch_unwind()
            .await;
        match dispatched {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                error!(action = %node.action, %message, "action dispatch panicked");
                Err(OxherdError::Fatal(format!(
                    "dispatch panic: {message}"
                )))
            }
        }
    }

    async fn dispatch_inner(&self, node: &mut ActionNode, tablet_path: &str) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        match (node.action, node.args.clone()) {
            (ActionKind::Ping, _) => Ok(()),
            (ActionKind::Sleep, ActionArgs::Sleep(ms)) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            (ActionKind::SetReadOnly, _) => self.set_read_only(tablet_path, true).await,
            (ActionKind::SetReadWrite, _) => self.set_read_only(tablet_path, false).await,
            (ActionKind::ChangeType, ActionArgs::ChangeType(new_type)) => {
                records::change_type(conn, tablet_path, new_type).await
            }
            (ActionKind::DemoteMaster, _) => {
                let position = self.mysql.demote_master().await?;
                let mut info = read_tablet(conn, tablet_path).await?;
                info.tablet.state = TabletState::ReadOnly;
                // No serving graph update: the master is about to be
                // replaced, and reads keep working meanwhile.
                update_tablet(conn, &mut info).await?;
                node.reply = ActionReply::Position(position);
                Ok(())
            }
            (ActionKind::PromoteSlave, ActionArgs::PromoteSlave(shard_action_path)) => {
                self.promote_slave(tablet_path, &shard_action_path).await
            }
            (ActionKind::RestartSlave, ActionArgs::RestartSlave(args)) => {
                self.restart_slave(tablet_path, args).await
            }
            (ActionKind::StopSlave, _) => self.mysql.stop_slave().await,
            (ActionKind::BreakSlaves, _) => self.mysql.break_slaves().await,
            (ActionKind::MasterPosition, _) => {
                node.reply = ActionReply::Position(self.mysql.master_status().await?);
                Ok(())
            }
            (ActionKind::SlavePosition, _) => {
                node.reply = ActionReply::Position(self.mysql.slave_status().await?);
                Ok(())
            }
            (ActionKind::ReparentPosition, ActionArgs::ReparentPosition(position)) => {
                let promotion = self.mysql.reparent_position(&position).await?;
                let alias = paths::alias_from_tablet_path(tablet_path)?;
                node.reply = ActionReply::RestartSlaveData(RestartSlaveData {
                    replication_state: promotion.replication_state,
                    wait_position: promotion.wait_position,
                    time_promoted: promotion.time_promoted,
                    parent: alias,
                    force: false,
                });
                Ok(())
            }
            (ActionKind::WaitSlavePosition, ActionArgs::WaitSlavePosition(args)) => {
                self.mysql
                    .wait_master_pos(
                        &args.replication_position,
                        Duration::from_secs(args.wait_timeout_secs),
                    )
                    .await?;
                node.reply = ActionReply::Position(self.mysql.slave_status().await?);
                Ok(())
            }
            (ActionKind::SlaveWasPromoted, _) => self.slave_was_promoted(tablet_path).await,
            (ActionKind::SlaveWasRestarted, ActionArgs::SlaveWasRestarted(args)) => {
                self.slave_was_restarted(tablet_path, args).await
            }
            (ActionKind::Scrap, _) => records::scrap(conn, tablet_path, false).await,
            (ActionKind::GetSchema, _) => {
                let info = read_tablet(conn, tablet_path).await?;
                node.reply =
                    ActionReply::Schema(self.mysql.get_schema(&info.tablet.db_name()).await?);
                Ok(())
            }
            (ActionKind::PreflightSchema, ActionArgs::PreflightSchema(change)) => {
                let info = read_tablet(conn, tablet_path).await?;
                node.reply = ActionReply::SchemaChange(
                    self.mysql
                        .preflight_schema_change(&info.tablet.db_name(), &change)
                        .await?,
                );
                Ok(())
            }
            (ActionKind::ApplySchema, ActionArgs::ApplySchema(change)) => {
                let info = read_tablet(conn, tablet_path).await?;
                node.reply = ActionReply::SchemaChange(
                    self.mysql
                        .apply_schema_change(&info.tablet.db_name(), &change)
                        .await?,
                );
                Ok(())
            }
            (ActionKind::ExecuteHook, ActionArgs::ExecuteHook(hook)) => {
                node.reply = ActionReply::Hook(hook.execute(&self.hooks_dir).await);
                Ok(())
            }
            (ActionKind::GetSlaves, _) => {
                node.reply = ActionReply::Slaves(SlaveList {
                    addrs: self.mysql.get_slaves().await?,
                });
                Ok(())
            }
            (ActionKind::Snapshot, ActionArgs::Snapshot(args)) => {
                self.snapshot(node, tablet_path, args).await
            }
            (ActionKind::SnapshotSourceEnd, ActionArgs::SnapshotSourceEnd(args)) => {
                self.mysql
                    .snapshot_source_end(args.slave_start_required, args.read_only)
                    .await
            }
            (ActionKind::PartialSnapshot, ActionArgs::PartialSnapshot(args)) => {
                self.partial_snapshot(node, tablet_path, args).await
            }
            (ActionKind::Restore, ActionArgs::Restore(args)) => {
                self.restore(tablet_path, args, false).await
            }
            (ActionKind::PartialRestore, ActionArgs::Restore(args)) => {
                self.restore(tablet_path, args, true).await
            }
            (action, _) => Err(OxherdError::Fatal(format!(
                "invalid action for tablet actor: {action}"
            ))),
        }
    }

    async fn set_read_only(&self, tablet_path: &str, read_only: bool) -> OxherdResult<()> {
        self.mysql.set_read_only(read_only).await?;
        let mut info = read_tablet(self.conn.as_ref(), tablet_path).await?;
        info.tablet.state = if read_only {
            TabletState::ReadOnly
        } else {
            TabletState::ReadWrite
        };
        update_tablet(self.conn.as_ref(), &mut info).await
    }

    async fn promote_slave(&self, tablet_path: &str, shard_action_path: &str) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let mut info = read_tablet(conn, tablet_path).await?;

        // The presence of this node means a promotion already succeeded;
        // promoting twice would wedge replication.
        let scratch_path = format!("{shard_action_path}/{RESTART_SLAVE_DATA_NODE}");
        if conn.exists(&scratch_path).await?.is_some() {
            return Err(OxherdError::Aborted(format!(
                "slave restart data already exists - suspicious: {scratch_path}"
            )));
        }

        let promotion = self.mysql.promote_slave().await?;
        let restart_data = RestartSlaveData {
            replication_state: promotion.replication_state,
            wait_position: promotion.wait_position,
            time_promoted: promotion.time_promoted,
            parent: info.alias(),
            force: info.tablet.parent.is_none(),
        };
        // This data is valuable - commit it to topology first.
        conn.create_json(&scratch_path, &restart_data, CreateMode::Persistent)
            .await?;

        // Leave the replication graph as a slave before rejoining as
        // master.
        if info.tablet.parent.is_some() {
            delete_replication_path(conn, &info.tablet).await?;
        }
        info.tablet.state = TabletState::ReadWrite;
        info.tablet.tablet_type = TabletType::Master;
        info.tablet.parent = None;
        update_tablet(conn, &mut info).await?;
        create_replication_path(conn, &info.tablet).await
    }

    async fn restart_slave(&self, tablet_path: &str, args: RestartSlaveArgs) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let mut info = read_tablet(conn, tablet_path).await?;

        let restart_data = match args.restart_slave_data {
            Some(data) => data,
            None => {
                let scratch_path =
                    format!("{}/{RESTART_SLAVE_DATA_NODE}", args.shard_action_path);
                conn.get_json::<RestartSlaveData>(&scratch_path).await?.0
            }
        };

        if info.tablet.parent.as_ref() != Some(&restart_data.parent) {
            // We look reparented. The only step that can have failed is the
            // replication-graph insert; do NOT reattach again, that would
            // wedge replication or corrupt data.
            delete_replication_path(conn, &info.tablet).await?;

            if info.tablet.tablet_type == TabletType::Lag {
                // Park lagged slaves as orphans; they reattach once caught
                // up.
                info.tablet.tablet_type = TabletType::LagOrphan;
            } else {
                self.mysql
                    .restart_slave(
                        &restart_data.replication_state,
                        &restart_data.wait_position,
                        restart_data.time_promoted,
                    )
                    .await?;
            }
            if info.tablet.tablet_type == TabletType::Master {
                // The demoted master rejoins as an ordinary replica.
                info.tablet.tablet_type = TabletType::Replica;
                info.tablet.state = TabletState::ReadOnly;
            }
            info.tablet.parent = Some(restart_data.parent.clone());
            update_tablet(conn, &mut info).await?;
        } else if restart_data.force {
            self.mysql
                .restart_slave(
                    &restart_data.replication_state,
                    &restart_data.wait_position,
                    restart_data.time_promoted,
                )
                .await?;
            if info.tablet.tablet_type == TabletType::LagOrphan {
                info.tablet.tablet_type = TabletType::Lag;
                update_tablet(conn, &mut info).await?;
            }
        }

        create_replication_path(conn, &info.tablet).await
    }

    async fn slave_was_promoted(&self, tablet_path: &str) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        // The external actor claims this instance is already master; verify
        // before touching topology.
        if !self.mysql.is_master().await? {
            return Err(OxherdError::Fatal(format!(
                "instance is not master but was reported promoted: {tablet_path}"
            )));
        }

        let mut info = read_tablet(conn, tablet_path).await?;
        if info.tablet.parent.is_some() {
            delete_replication_path(conn, &info.tablet).await?;
        }
        info.tablet.tablet_type = TabletType::Master;
        info.tablet.state = TabletState::ReadWrite;
        info.tablet.parent = None;
        update_tablet(conn, &mut info).await?;
        create_replication_path(conn, &info.tablet).await
    }

    async fn slave_was_restarted(
        &self,
        tablet_path: &str,
        args: SlaveWasRestartedArgs,
    ) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let mut info = read_tablet(conn, tablet_path).await?;

        let master_addr = self.mysql.master_addr().await?;
        if master_addr != args.expected_master_addr
            && master_addr != args.expected_master_ip_addr
        {
            if args.scrap_stragglers {
                info!(%tablet_path, %master_addr, "scrapping straggler");
                return records::scrap(conn, tablet_path, false).await;
            }
            return Err(OxherdError::Aborted(format!(
                "slave replicates from {master_addr}, expected {} or {}",
                args.expected_master_addr, args.expected_master_ip_addr
            )));
        }

        if info.tablet.parent.as_ref() != Some(&args.parent) {
            delete_replication_path(conn, &info.tablet).await?;
            if info.tablet.tablet_type == TabletType::Master {
                // The deposed master rejoins as an ordinary replica.
                info.tablet.tablet_type = TabletType::Replica;
                info.tablet.state = TabletState::ReadOnly;
            }
            info.tablet.parent = Some(args.parent.clone());
            update_tablet(conn, &mut info).await?;
        }
        create_replication_path(conn, &info.tablet).await
    }

    async fn snapshot(
        &self,
        node: &mut ActionNode,
        tablet_path: &str,
        args: SnapshotArgs,
    ) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let info = read_tablet(conn, tablet_path).await?;
        if info.tablet.tablet_type != TabletType::Backup {
            return Err(OxherdError::Aborted(format!(
                "expected backup type, not {}: {tablet_path}",
                info.tablet.tablet_type
            )));
        }
        let manifest_path = self
            .mysql
            .create_snapshot(&info.tablet.db_name(), &info.tablet.addr, args.concurrency)
            .await?;
        node.reply = ActionReply::Snapshot(SnapshotReply {
            parent_path: self.snapshot_parent_path(&info),
            manifest_path,
        });
        Ok(())
    }

    async fn partial_snapshot(
        &self,
        node: &mut ActionNode,
        tablet_path: &str,
        args: PartialSnapshotArgs,
    ) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let info = read_tablet(conn, tablet_path).await?;
        if info.tablet.tablet_type != TabletType::Backup {
            return Err(OxherdError::Aborted(format!(
                "expected backup type, not {}: {tablet_path}",
                info.tablet.tablet_type
            )));
        }
        let manifest_path = self
            .mysql
            .create_split_snapshot(
                &info.tablet.db_name(),
                &args.key_name,
                &args.key_range,
                &info.tablet.addr,
                args.concurrency,
            )
            .await?;
        node.reply = ActionReply::Snapshot(SnapshotReply {
            parent_path: self.snapshot_parent_path(&info),
            manifest_path,
        });
        Ok(())
    }

    /// Who a restored copy of this snapshot should replicate from: our own
    /// master, or this tablet if it is the master.
    fn snapshot_parent_path(&self, info: &records::TabletInfo) -> String {
        match &info.tablet.parent {
            None => info.path().to_owned(),
            Some(parent) => paths::tablet_path(parent),
        }
    }

    async fn restore(
        &self,
        tablet_path: &str,
        args: RestoreArgs,
        partial: bool,
    ) -> OxherdResult<()> {
        let conn = self.conn.as_ref();
        let mut info = read_tablet(conn, tablet_path).await?;
        if info.tablet.tablet_type != TabletType::Restore {
            return Err(OxherdError::Aborted(format!(
                "expected restore type, not {}: {tablet_path}",
                info.tablet.tablet_type
            )));
        }

        let source = read_tablet(conn, &args.src_tablet_path).await?;
        let src_file_path = if args.src_file_path.eq_ignore_ascii_case("default") {
            if partial {
                format!("/{PARTIAL_SNAPSHOT_MANIFEST_FILE}")
            } else {
                format!("/{SNAPSHOT_MANIFEST_FILE}")
            }
        } else {
            args.src_file_path.clone()
        };

        let parent = read_tablet(conn, &args.parent_path).await?;
        if parent.tablet.tablet_type != TabletType::Master {
            return Err(OxherdError::Aborted(format!(
                "restore expected master parent: {} {}",
                parent.tablet.tablet_type, args.parent_path
            )));
        }

        let key_range = if partial {
            let manifest: SplitSnapshotManifest =
                fetch_json(self.fetcher.as_ref(), &source.tablet.addr, &src_file_path).await?;
            self.mysql.restore_from_partial_snapshot(&manifest).await?;
            manifest.key_range
        } else {
            let manifest: SnapshotManifest =
                fetch_json(self.fetcher.as_ref(), &source.tablet.addr, &src_file_path).await?;
            self.mysql.restore_from_snapshot(&manifest).await?;
            source.tablet.key_range.clone()
        };

        // Update the authoritative tablet record first, then the graph.
        info.tablet.parent = Some(parent.alias());
        info.tablet.keyspace = source.tablet.keyspace.clone();
        info.tablet.shard = source.tablet.shard.clone();
        info.tablet.tablet_type = TabletType::Spare;
        info.tablet.key_range = key_range;
        update_tablet(conn, &mut info).await?;
        create_replication_path(conn, &info.tablet).await
    }
}

/// Write the terminal copy of `node` into the action log. Creates the log
/// directory when the target was made without one.
pub async fn store_action_response(
    conn: &dyn TopoConn,
    node: &mut ActionNode,
    action_path: &str,
    result: &OxherdResult<()>,
) -> OxherdResult<()> {
    match result {
        Ok(()) => {
            node.state = ActionState::Done;
            node.error.clear();
        }
        Err(e) => {
            node.state = ActionState::Failed;
            node.error = e.to_string();
        }
    }

    let data = node.encode()?;
    let log_path = paths::actionlog_path_for(action_path)?;
    match conn
        .create(&log_path, data.clone().into_bytes(), CreateMode::Persistent)
        .await
    {
        Ok(_) => Ok(()),
        Err(OxherdError::NodeNotFound(_)) => {
            // The target was created without an actionlog; correct that.
            let log_dir = log_path
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_owned())
                .unwrap_or_default();
            ensure_path(conn, &log_dir).await?;
            conn.create(&log_path, data.into_bytes(), CreateMode::Persistent)
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// The long-running per-tablet agent: registers liveness, then serializes
/// dispatch of everything that lands in the tablet's action queue.
pub struct Agent {
    actor: TabletActor,
    conn: Arc<dyn TopoConn>,
    alias: TabletAlias,
}

impl Agent {
    pub fn new(
        conn: Arc<dyn TopoConn>,
        mysql: Arc<dyn MysqlDriver>,
        fetcher: Arc<dyn ManifestFetcher>,
        hooks_dir: PathBuf,
        alias: TabletAlias,
    ) -> Self {
        Agent {
            actor: TabletActor::new(Arc::clone(&conn), mysql, fetcher, hooks_dir),
            conn,
            alias,
        }
    }

    pub fn actor(&self) -> &TabletActor {
        &self.actor
    }

    /// Create the agent's ephemeral pid node.
    pub async fn register(&self) -> OxherdResult<()> {
        records::register_pid(self.conn.as_ref(), &self.alias).await
    }

    /// Watch the action queue and dispatch nodes in order until `shutdown`
    /// flips. Action failures are recorded on the log and do not stop the
    /// loop; topology failures do.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> OxherdResult<()> {
        let queue_path = paths::tablet_action_path(&self.alias);
        let mut queue_watch = self.conn.watch(&queue_path).await?;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut dispatched = false;
            for child in self.conn.children(&queue_path).await? {
                if !child.starts_with(paths::ACTION_NODE_PREFIX) {
                    continue;
                }
                let action_path = format!("{queue_path}/{child}");
                let (data, _) = match self.conn.get(&action_path).await {
                    Ok(found) => found,
                    Err(OxherdError::NodeNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let text = String::from_utf8(data)
                    .map_err(|e| OxherdError::Parse(format!("action node not utf-8: {e}")))?;
                let node = ActionNode::decode(&text)?;
                dispatched = true;
                if let Err(e) = self
                    .actor
                    .handle_action(&action_path, node.action, &node.guid, false)
                    .await
                {
                    warn!(%action_path, %e, "action failed");
                }
            }

            if !dispatched {
                tokio::select! {
                    changed = queue_watch.changed() => changed?,
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
