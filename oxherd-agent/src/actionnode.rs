//! Action node envelopes and their wire codec.
//!
//! An action node is the queued unit of work for an agent. On the wire it
//! is three concatenated JSON objects separated by newlines: a header
//! (action name, guid, state, error), the typed args, and the typed reply.
//! The last two may be `{}`, and older writers may omit them entirely; the
//! decoder tolerates missing trailing sections.

use std::fmt;

use oxherd_common::{KeyRange, TabletAlias, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use replication_position::{ReplicationPosition, ReplicationState};
use serde::{Deserialize, Serialize};

use crate::hook::{Hook, HookResult};
use crate::manifest::{SchemaChange, SchemaChangeResult, SchemaDefinition};

/// Name of the scratch file a successful `PromoteSlave` writes under the
/// shard's action path. Its presence makes promotion non-repeatable.
pub const RESTART_SLAVE_DATA_NODE: &str = "restart_slave_data";

/// Every action an agent or shard queue understands. The enum doubles as
/// the registration table: it maps each name to its arg and reply shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    // Tablet actions.
    Ping,
    Sleep,
    SetReadOnly,
    SetReadWrite,
    ChangeType,
    DemoteMaster,
    PromoteSlave,
    RestartSlave,
    StopSlave,
    BreakSlaves,
    MasterPosition,
    SlavePosition,
    ReparentPosition,
    WaitSlavePosition,
    SlaveWasPromoted,
    SlaveWasRestarted,
    Scrap,
    GetSchema,
    PreflightSchema,
    ApplySchema,
    ExecuteHook,
    GetSlaves,
    Snapshot,
    SnapshotSourceEnd,
    Restore,
    PartialSnapshot,
    PartialRestore,

    // Shard actions: involve all tablets in a shard.
    ReparentShard,
    ShardExternallyReparented,
    RebuildShard,
    CheckShard,
    ApplySchemaShard,

    // Keyspace actions.
    RebuildKeyspace,
    ApplySchemaKeyspace,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle of an action node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    /// All actions are queued initially; serialized as the empty string for
    /// compatibility with nodes written before the state field existed.
    #[default]
    #[serde(rename = "")]
    Queued,
    Running,
    Failed,
    Done,
}

/// How a slave reattaches to a freshly promoted master.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSlaveData {
    pub replication_state: ReplicationState,
    pub wait_position: ReplicationPosition,
    /// Unix nanoseconds of the promotion, used to verify replication.
    pub time_promoted: i64,
    pub parent: TabletAlias,
    pub force: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSlaveArgs {
    /// The shard action path holding the promotion scratch data.
    pub shard_action_path: String,
    /// Inline restart data; when absent the agent reads the scratch node.
    pub restart_slave_data: Option<RestartSlaveData>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveWasRestartedArgs {
    pub parent: TabletAlias,
    pub expected_master_addr: String,
    pub expected_master_ip_addr: String,
    pub scrap_stragglers: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSlavePositionArgs {
    pub replication_position: ReplicationPosition,
    pub wait_timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotArgs {
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSourceEndArgs {
    pub slave_start_required: bool,
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSnapshotArgs {
    /// The sharding key column.
    pub key_name: String,
    pub key_range: KeyRange,
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreArgs {
    pub src_tablet_path: String,
    /// Path of the manifest on the source; `default` resolves to the
    /// source's snapshot directory.
    pub src_file_path: String,
    pub parent_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplySchemaShardArgs {
    pub change: String,
    pub simple: bool,
}

/// Reply for snapshot actions: where the manifest is and who to parent to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotReply {
    pub parent_path: String,
    pub manifest_path: String,
}

/// Reply for `GetSlaves`: IP addresses of connected replicas.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveList {
    pub addrs: Vec<String>,
}

/// Typed arguments, one variant per action that takes any.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionArgs {
    None,
    /// Sleep duration in milliseconds.
    Sleep(u64),
    ChangeType(TabletType),
    /// The shard action path to publish promotion data under.
    PromoteSlave(String),
    RestartSlave(RestartSlaveArgs),
    ReparentPosition(ReplicationPosition),
    WaitSlavePosition(WaitSlavePositionArgs),
    SlaveWasRestarted(SlaveWasRestartedArgs),
    ExecuteHook(Hook),
    PreflightSchema(String),
    ApplySchema(SchemaChange),
    Snapshot(SnapshotArgs),
    SnapshotSourceEnd(SnapshotSourceEndArgs),
    PartialSnapshot(PartialSnapshotArgs),
    Restore(RestoreArgs),
    /// Master-elect tablet path for shard reparents.
    ReparentShard(String),
    ShardExternallyReparented(String),
    ApplySchemaShard(ApplySchemaShardArgs),
    ApplySchemaKeyspace(ApplySchemaShardArgs),
}

/// Typed replies, one variant per action that produces one.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionReply {
    None,
    Position(ReplicationPosition),
    RestartSlaveData(RestartSlaveData),
    Schema(SchemaDefinition),
    SchemaChange(SchemaChangeResult),
    Hook(HookResult),
    Snapshot(SnapshotReply),
    Slaves(SlaveList),
}

#[derive(Serialize, Deserialize)]
struct ActionHeader {
    #[serde(rename = "Action")]
    action: ActionKind,
    #[serde(rename = "ActionGuid", default)]
    guid: String,
    #[serde(rename = "Error", default)]
    error: String,
    #[serde(rename = "State", default)]
    state: ActionState,
}

/// A queued unit of work for an agent, with typed args and reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionNode {
    pub action: ActionKind,
    pub guid: String,
    pub error: String,
    pub state: ActionState,
    pub args: ActionArgs,
    pub reply: ActionReply,
}

impl ActionNode {
    pub fn new(action: ActionKind, args: ActionArgs) -> Self {
        ActionNode {
            action,
            guid: uuid::Uuid::new_v4().to_string(),
            error: String::new(),
            state: ActionState::Queued,
            args,
            reply: ActionReply::None,
        }
    }

    /// Encode to the three-object wire format.
    pub fn encode(&self) -> OxherdResult<String> {
        let header = ActionHeader {
            action: self.action,
            guid: self.guid.clone(),
            error: self.error.clone(),
            state: self.state,
        };
        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        out.push_str(&encode_args(&self.args)?);
        out.push('\n');
        out.push_str(&encode_reply(&self.reply)?);
        out.push('\n');
        Ok(out)
    }

    /// Decode from the wire format, tolerating missing args/reply objects.
    pub fn decode(data: &str) -> OxherdResult<Self> {
        let mut docs = serde_json::Deserializer::from_str(data).into_iter::<serde_json::Value>();

        let header: ActionHeader = match docs.next() {
            Some(Ok(value)) => serde_json::from_value(value)?,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(OxherdError::Parse("empty action node".into()));
            }
        };

        let args_value = match docs.next() {
            Some(Ok(value)) => Some(value),
            Some(Err(e)) => return Err(e.into()),
            None => None,
        };
        let reply_value = match docs.next() {
            Some(Ok(value)) => Some(value),
            Some(Err(e)) => return Err(e.into()),
            None => None,
        };

        Ok(ActionNode {
            args: decode_args(header.action, args_value)?,
            reply: decode_reply(header.action, reply_value)?,
            action: header.action,
            guid: header.guid,
            error: header.error,
            state: header.state,
        })
    }
}

fn encode_args(args: &ActionArgs) -> OxherdResult<String> {
    let value = match args {
        ActionArgs::None => serde_json::json!({}),
        ActionArgs::Sleep(ms) => serde_json::json!({ "DurationMs": ms }),
        ActionArgs::ChangeType(t) => serde_json::json!({ "TabletType": t }),
        ActionArgs::PromoteSlave(path) => serde_json::json!({ "ShardActionPath": path }),
        ActionArgs::RestartSlave(a) => serde_json::to_value(a)?,
        ActionArgs::ReparentPosition(p) => serde_json::to_value(p)?,
        ActionArgs::WaitSlavePosition(a) => serde_json::to_value(a)?,
        ActionArgs::SlaveWasRestarted(a) => serde_json::to_value(a)?,
        ActionArgs::ExecuteHook(h) => serde_json::to_value(h)?,
        ActionArgs::PreflightSchema(change) => serde_json::json!({ "Change": change }),
        ActionArgs::ApplySchema(c) => serde_json::to_value(c)?,
        ActionArgs::Snapshot(a) => serde_json::to_value(a)?,
        ActionArgs::SnapshotSourceEnd(a) => serde_json::to_value(a)?,
        ActionArgs::PartialSnapshot(a) => serde_json::to_value(a)?,
        ActionArgs::Restore(a) => serde_json::to_value(a)?,
        ActionArgs::ReparentShard(path) | ActionArgs::ShardExternallyReparented(path) => {
            serde_json::json!({ "MasterElectPath": path })
        }
        ActionArgs::ApplySchemaShard(a) | ActionArgs::ApplySchemaKeyspace(a) => {
            serde_json::to_value(a)?
        }
    };
    Ok(serde_json::to_string(&value)?)
}

fn encode_reply(reply: &ActionReply) -> OxherdResult<String> {
    let value = match reply {
        ActionReply::None => serde_json::json!({}),
        ActionReply::Position(p) => serde_json::to_value(p)?,
        ActionReply::RestartSlaveData(d) => serde_json::to_value(d)?,
        ActionReply::Schema(s) => serde_json::to_value(s)?,
        ActionReply::SchemaChange(s) => serde_json::to_value(s)?,
        ActionReply::Hook(h) => serde_json::to_value(h)?,
        ActionReply::Snapshot(s) => serde_json::to_value(s)?,
        ActionReply::Slaves(s) => serde_json::to_value(s)?,
    };
    Ok(serde_json::to_string(&value)?)
}

fn string_field(value: &serde_json::Value, field: &str) -> String {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn decode_args(action: ActionKind, value: Option<serde_json::Value>) -> OxherdResult<ActionArgs> {
    use ActionKind::*;
    let value = value.unwrap_or_else(|| serde_json::json!({}));
    Ok(match action {
        Sleep => ActionArgs::Sleep(
            value
                .get("DurationMs")
                .and_then(|v| v.as_u64())
                .unwrap_or_default(),
        ),
        ChangeType => {
            let t = value
                .get("TabletType")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if t.is_null() {
                return Err(OxherdError::Parse("ChangeType args missing TabletType".into()));
            }
            ActionArgs::ChangeType(serde_json::from_value(t)?)
        }
        PromoteSlave => ActionArgs::PromoteSlave(string_field(&value, "ShardActionPath")),
        RestartSlave => ActionArgs::RestartSlave(serde_json::from_value(value)?),
        ReparentPosition => ActionArgs::ReparentPosition(serde_json::from_value(value)?),
        WaitSlavePosition => ActionArgs::WaitSlavePosition(serde_json::from_value(value)?),
        SlaveWasRestarted => ActionArgs::SlaveWasRestarted(serde_json::from_value(value)?),
        ExecuteHook => ActionArgs::ExecuteHook(serde_json::from_value(value)?),
        PreflightSchema => ActionArgs::PreflightSchema(string_field(&value, "Change")),
        ApplySchema => ActionArgs::ApplySchema(serde_json::from_value(value)?),
        Snapshot => ActionArgs::Snapshot(serde_json::from_value(value)?),
        SnapshotSourceEnd => ActionArgs::SnapshotSourceEnd(serde_json::from_value(value)?),
        PartialSnapshot => ActionArgs::PartialSnapshot(serde_json::from_value(value)?),
        Restore | PartialRestore => ActionArgs::Restore(serde_json::from_value(value)?),
        ReparentShard => ActionArgs::ReparentShard(string_field(&value, "MasterElectPath")),
        ShardExternallyReparented => {
            ActionArgs::ShardExternallyReparented(string_field(&value, "MasterElectPath"))
        }
        ApplySchemaShard => ActionArgs::ApplySchemaShard(serde_json::from_value(value)?),
        ApplySchemaKeyspace => ActionArgs::ApplySchemaKeyspace(serde_json::from_value(value)?),
        _ => ActionArgs::None,
    })
}

fn decode_reply(action: ActionKind, value: Option<serde_json::Value>) -> OxherdResult<ActionReply> {
    use ActionKind::*;
    let Some(value) = value else {
        return Ok(ActionReply::None);
    };
    // An empty object is the "no reply yet" placeholder for every action.
    if value.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return Ok(ActionReply::None);
    }
    Ok(match action {
        DemoteMaster | MasterPosition | SlavePosition | WaitSlavePosition => {
            ActionReply::Position(serde_json::from_value(value)?)
        }
        ReparentPosition => ActionReply::RestartSlaveData(serde_json::from_value(value)?),
        GetSchema => ActionReply::Schema(serde_json::from_value(value)?),
        PreflightSchema | ApplySchema => ActionReply::SchemaChange(serde_json::from_value(value)?),
        ExecuteHook => ActionReply::Hook(serde_json::from_value(value)?),
        Snapshot | PartialSnapshot => ActionReply::Snapshot(serde_json::from_value(value)?),
        GetSlaves => ActionReply::Slaves(serde_json::from_value(value)?),
        _ => ActionReply::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(node: &ActionNode) {
        let encoded = node.encode().unwrap();
        let decoded = ActionNode::decode(&encoded).unwrap();
        assert_eq!(&decoded, node, "wire: {encoded}");
    }

    #[test]
    fn every_arg_shape_round_trips() {
        let mut nodes = vec![
            ActionNode::new(ActionKind::Ping, ActionArgs::None),
            ActionNode::new(ActionKind::Sleep, ActionArgs::Sleep(250)),
            ActionNode::new(
                ActionKind::ChangeType,
                ActionArgs::ChangeType(TabletType::Spare),
            ),
            ActionNode::new(
                ActionKind::PromoteSlave,
                ActionArgs::PromoteSlave("/global/vt/keyspaces/k/shards/0/action".into()),
            ),
            ActionNode::new(
                ActionKind::RestartSlave,
                ActionArgs::RestartSlave(RestartSlaveArgs {
                    shard_action_path: "/global/vt/keyspaces/k/shards/0/action".into(),
                    restart_slave_data: Some(RestartSlaveData {
                        parent: TabletAlias::new("nyc", 1),
                        force: true,
                        ..Default::default()
                    }),
                }),
            ),
            ActionNode::new(
                ActionKind::ReparentPosition,
                ActionArgs::ReparentPosition(ReplicationPosition {
                    master_log_file: "vt-bin.000003".into(),
                    master_log_position: 420,
                    seconds_behind_master: 0,
                }),
            ),
            ActionNode::new(
                ActionKind::SlaveWasRestarted,
                ActionArgs::SlaveWasRestarted(SlaveWasRestartedArgs {
                    parent: TabletAlias::new("nyc", 2),
                    expected_master_addr: "host2:3306".into(),
                    expected_master_ip_addr: "10.0.0.2:3306".into(),
                    scrap_stragglers: false,
                }),
            ),
            ActionNode::new(
                ActionKind::ExecuteHook,
                ActionArgs::ExecuteHook(Hook::new_simple("live_server_check")),
            ),
            ActionNode::new(
                ActionKind::Restore,
                ActionArgs::Restore(RestoreArgs {
                    src_tablet_path: "/nyc/vt/tablets/0000000001".into(),
                    src_file_path: "default".into(),
                    parent_path: "/nyc/vt/tablets/0000000002".into(),
                }),
            ),
        ];

        // A reply-bearing terminal node.
        let mut done = ActionNode::new(ActionKind::MasterPosition, ActionArgs::None);
        done.state = ActionState::Done;
        done.reply = ActionReply::Position(ReplicationPosition {
            master_log_file: "vt-bin.000009".into(),
            master_log_position: 99,
            seconds_behind_master: 0,
        });
        nodes.push(done);

        let mut failed = ActionNode::new(ActionKind::Scrap, ActionArgs::None);
        failed.state = ActionState::Failed;
        failed.error = "mysql went away".into();
        nodes.push(failed);

        for node in &nodes {
            round_trip(node);
        }
    }

    #[test]
    fn decoder_tolerates_missing_trailing_objects() {
        let node = ActionNode::new(ActionKind::Ping, ActionArgs::None);
        let header_only = node.encode().unwrap().lines().next().unwrap().to_owned();
        let decoded = ActionNode::decode(&header_only).unwrap();
        assert_eq!(decoded.action, ActionKind::Ping);
        assert_eq!(decoded.args, ActionArgs::None);
        assert_eq!(decoded.reply, ActionReply::None);

        let header_and_args = format!("{header_only}\n{{}}");
        let decoded = ActionNode::decode(&header_and_args).unwrap();
        assert_eq!(decoded.reply, ActionReply::None);
    }

    #[test]
    fn queued_state_serializes_as_empty_string() {
        let node = ActionNode::new(ActionKind::Ping, ActionArgs::None);
        let encoded = node.encode().unwrap();
        assert!(encoded.contains(r#""State":"""#), "wire: {encoded}");
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        assert!(matches!(
            ActionNode::decode(""),
            Err(OxherdError::Parse(_))
        ));
    }
}
