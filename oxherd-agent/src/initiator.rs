//! Posting actions and blocking for their outcomes.
//!
//! `initiate` is at-most-once for the submitter; the action itself is
//! at-most-one-running because of the actor's compare-and-swap claim. A
//! submitter that crashes and retries enqueues a second node; idempotence
//! is a property of individual handlers, not of the queue.

use std::sync::Arc;
use std::time::Duration;

use oxherd_common::{TabletAlias, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::{paths, wait_for_node, CreateMode, TopoConn};
use replication_position::ReplicationPosition;
use tracing::info;

use crate::actionnode::{
    ActionArgs, ActionKind, ActionNode, ActionReply, ActionState, ApplySchemaShardArgs,
    PartialSnapshotArgs, RestartSlaveArgs, RestoreArgs, SlaveWasRestartedArgs, SnapshotArgs,
    SnapshotSourceEndArgs, WaitSlavePositionArgs,
};
use crate::hook::Hook;
use crate::manifest::SchemaChange;

/// Creates action nodes in target queues and waits for their terminal
/// records.
#[derive(Clone)]
pub struct ActionInitiator {
    conn: Arc<dyn TopoConn>,
}

impl ActionInitiator {
    pub fn new(conn: Arc<dyn TopoConn>) -> Self {
        ActionInitiator { conn }
    }

    /// Queue `node` under `queue_path`, returning the created action path.
    pub async fn initiate(&self, queue_path: &str, node: ActionNode) -> OxherdResult<String> {
        debug_assert_eq!(node.state, ActionState::Queued);
        let data = node.encode()?;
        let prefix = format!("{queue_path}/{}", paths::ACTION_NODE_PREFIX);
        let path = self
            .conn
            .create(&prefix, data.into_bytes(), CreateMode::Sequential)
            .await?;
        info!(action = %node.action, %path, "queued action");
        Ok(path)
    }

    async fn tablet_action(
        &self,
        alias: &TabletAlias,
        action: ActionKind,
        args: ActionArgs,
    ) -> OxherdResult<String> {
        self.initiate(
            &paths::tablet_action_path(alias),
            ActionNode::new(action, args),
        )
        .await
    }

    async fn shard_action(
        &self,
        keyspace: &str,
        shard: &str,
        action: ActionKind,
        args: ActionArgs,
    ) -> OxherdResult<String> {
        self.initiate(
            &paths::shard_action_path(keyspace, shard),
            ActionNode::new(action, args),
        )
        .await
    }

    pub async fn ping(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::Ping, ActionArgs::None).await
    }

    pub async fn sleep(&self, alias: &TabletAlias, duration_ms: u64) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::Sleep, ActionArgs::Sleep(duration_ms))
            .await
    }

    pub async fn set_read_only(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::SetReadOnly, ActionArgs::None)
            .await
    }

    pub async fn set_read_write(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::SetReadWrite, ActionArgs::None)
            .await
    }

    pub async fn change_type(
        &self,
        alias: &TabletAlias,
        tablet_type: TabletType,
    ) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::ChangeType, ActionArgs::ChangeType(tablet_type))
            .await
    }

    pub async fn demote_master(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::DemoteMaster, ActionArgs::None)
            .await
    }

    pub async fn promote_slave(
        &self,
        alias: &TabletAlias,
        shard_action_path: &str,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::PromoteSlave,
            ActionArgs::PromoteSlave(shard_action_path.to_owned()),
        )
        .await
    }

    pub async fn restart_slave(
        &self,
        alias: &TabletAlias,
        args: RestartSlaveArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::RestartSlave, ActionArgs::RestartSlave(args))
            .await
    }

    pub async fn stop_slave(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::StopSlave, ActionArgs::None)
            .await
    }

    pub async fn break_slaves(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::BreakSlaves, ActionArgs::None)
            .await
    }

    pub async fn master_position(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::MasterPosition, ActionArgs::None)
            .await
    }

    pub async fn slave_position(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::SlavePosition, ActionArgs::None)
            .await
    }

    pub async fn reparent_position(
        &self,
        alias: &TabletAlias,
        position: &ReplicationPosition,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::ReparentPosition,
            ActionArgs::ReparentPosition(position.clone()),
        )
        .await
    }

    pub async fn wait_slave_position(
        &self,
        alias: &TabletAlias,
        args: WaitSlavePositionArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::WaitSlavePosition,
            ActionArgs::WaitSlavePosition(args),
        )
        .await
    }

    pub async fn slave_was_promoted(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::SlaveWasPromoted, ActionArgs::None)
            .await
    }

    pub async fn slave_was_restarted(
        &self,
        alias: &TabletAlias,
        args: SlaveWasRestartedArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::SlaveWasRestarted,
            ActionArgs::SlaveWasRestarted(args),
        )
        .await
    }

    pub async fn scrap(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::Scrap, ActionArgs::None).await
    }

    pub async fn get_schema(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::GetSchema, ActionArgs::None)
            .await
    }

    pub async fn preflight_schema(
        &self,
        alias: &TabletAlias,
        change: &str,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::PreflightSchema,
            ActionArgs::PreflightSchema(change.to_owned()),
        )
        .await
    }

    pub async fn apply_schema(
        &self,
        alias: &TabletAlias,
        change: SchemaChange,
    ) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::ApplySchema, ActionArgs::ApplySchema(change))
            .await
    }

    pub async fn execute_hook(&self, alias: &TabletAlias, hook: Hook) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::ExecuteHook, ActionArgs::ExecuteHook(hook))
            .await
    }

    pub async fn get_slaves(&self, alias: &TabletAlias) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::GetSlaves, ActionArgs::None)
            .await
    }

    pub async fn snapshot(&self, alias: &TabletAlias, args: SnapshotArgs) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::Snapshot, ActionArgs::Snapshot(args))
            .await
    }

    pub async fn snapshot_source_end(
        &self,
        alias: &TabletAlias,
        args: SnapshotSourceEndArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::SnapshotSourceEnd,
            ActionArgs::SnapshotSourceEnd(args),
        )
        .await
    }

    pub async fn partial_snapshot(
        &self,
        alias: &TabletAlias,
        args: PartialSnapshotArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(
            alias,
            ActionKind::PartialSnapshot,
            ActionArgs::PartialSnapshot(args),
        )
        .await
    }

    pub async fn restore(&self, alias: &TabletAlias, args: RestoreArgs) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::Restore, ActionArgs::Restore(args))
            .await
    }

    pub async fn partial_restore(
        &self,
        alias: &TabletAlias,
        args: RestoreArgs,
    ) -> OxherdResult<String> {
        self.tablet_action(alias, ActionKind::PartialRestore, ActionArgs::Restore(args))
            .await
    }

    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect_path: &str,
    ) -> OxherdResult<String> {
        self.shard_action(
            keyspace,
            shard,
            ActionKind::ReparentShard,
            ActionArgs::ReparentShard(master_elect_path.to_owned()),
        )
        .await
    }

    pub async fn shard_externally_reparented(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect_path: &str,
    ) -> OxherdResult<String> {
        self.shard_action(
            keyspace,
            shard,
            ActionKind::ShardExternallyReparented,
            ActionArgs::ShardExternallyReparented(master_elect_path.to_owned()),
        )
        .await
    }

    pub async fn rebuild_shard(&self, keyspace: &str, shard: &str) -> OxherdResult<String> {
        self.shard_action(keyspace, shard, ActionKind::RebuildShard, ActionArgs::None)
            .await
    }

    pub async fn check_shard(&self, keyspace: &str, shard: &str) -> OxherdResult<String> {
        self.shard_action(keyspace, shard, ActionKind::CheckShard, ActionArgs::None)
            .await
    }

    pub async fn apply_schema_shard(
        &self,
        keyspace: &str,
        shard: &str,
        args: ApplySchemaShardArgs,
    ) -> OxherdResult<String> {
        self.shard_action(
            keyspace,
            shard,
            ActionKind::ApplySchemaShard,
            ActionArgs::ApplySchemaShard(args),
        )
        .await
    }

    pub async fn rebuild_keyspace(&self, keyspace: &str) -> OxherdResult<String> {
        self.keyspace_action(keyspace, ActionKind::RebuildKeyspace, ActionArgs::None)
            .await
    }

    pub async fn apply_schema_keyspace(
        &self,
        keyspace: &str,
        args: ApplySchemaShardArgs,
    ) -> OxherdResult<String> {
        self.keyspace_action(
            keyspace,
            ActionKind::ApplySchemaKeyspace,
            ActionArgs::ApplySchemaKeyspace(args),
        )
        .await
    }

    async fn keyspace_action(
        &self,
        keyspace: &str,
        action: ActionKind,
        args: ActionArgs,
    ) -> OxherdResult<String> {
        self.initiate(
            &format!("{}/action", paths::keyspace_path(keyspace)),
            ActionNode::new(action, args),
        )
        .await
    }

    /// Wait for the action's terminal record to appear on the action log,
    /// and surface its outcome. On timeout the action keeps running on the
    /// agent; the caller has lost ownership of the result.
    pub async fn wait_for_completion(
        &self,
        action_path: &str,
        timeout: Duration,
    ) -> OxherdResult<()> {
        self.wait_for_completion_reply(action_path, timeout)
            .await
            .map(|_| ())
    }

    /// Like `wait_for_completion`, but hands back the typed reply.
    pub async fn wait_for_completion_reply(
        &self,
        action_path: &str,
        timeout: Duration,
    ) -> OxherdResult<ActionReply> {
        let log_path = paths::actionlog_path_for(action_path)?;
        let (data, _) = wait_for_node(self.conn.as_ref(), &log_path, timeout).await?;
        let text = String::from_utf8(data)
            .map_err(|e| OxherdError::Parse(format!("action log not utf-8: {e}")))?;
        let node = ActionNode::decode(&text)?;
        match node.state {
            ActionState::Done => Ok(node.reply),
            ActionState::Failed => Err(OxherdError::ActionFailed {
                path: action_path.to_owned(),
                error: node.error,
            }),
            state => Err(OxherdError::Internal(format!(
                "action log node {log_path} in non-terminal state {state:?}"
            ))),
        }
    }
}
