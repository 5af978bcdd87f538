//! Layout of the topology namespace.
//!
//! Per-cell subtrees hold tablet records and their queues; the global
//! subtree holds keyspaces, shards, and the replication graph. Everything
//! else in the system addresses nodes through these helpers, never by
//! concatenating strings inline.

use oxherd_common::TabletAlias;
use oxherd_errors::{OxherdError, OxherdResult};

/// Root of the global (cross-cell) subtree.
pub const GLOBAL_KEYSPACES: &str = "/global/vt/keyspaces";

pub fn tablets_path(cell: &str) -> String {
    format!("/{cell}/vt/tablets")
}

pub fn tablet_path(alias: &TabletAlias) -> String {
    format!("/{}/vt/tablets/{:010}", alias.cell, alias.uid)
}

pub fn tablet_action_path(alias: &TabletAlias) -> String {
    format!("{}/action", tablet_path(alias))
}

pub fn tablet_actionlog_path(alias: &TabletAlias) -> String {
    format!("{}/actionlog", tablet_path(alias))
}

pub fn tablet_pid_path(alias: &TabletAlias) -> String {
    format!("{}/pid", tablet_path(alias))
}

pub fn keyspace_path(keyspace: &str) -> String {
    format!("{GLOBAL_KEYSPACES}/{keyspace}")
}

pub fn shards_path(keyspace: &str) -> String {
    format!("{GLOBAL_KEYSPACES}/{keyspace}/shards")
}

pub fn shard_path(keyspace: &str, shard: &str) -> String {
    format!("{GLOBAL_KEYSPACES}/{keyspace}/shards/{shard}")
}

pub fn shard_action_path(keyspace: &str, shard: &str) -> String {
    format!("{}/action", shard_path(keyspace, shard))
}

pub fn shard_actionlog_path(keyspace: &str, shard: &str) -> String {
    format!("{}/actionlog", shard_path(keyspace, shard))
}

/// The replication graph lives directly under the shard node: master
/// aliases as children, slave aliases nested one deeper.
pub fn shard_replication_root(keyspace: &str, shard: &str) -> String {
    shard_path(keyspace, shard)
}

/// The queue node name prefix for sequential action nodes.
pub const ACTION_NODE_PREFIX: &str = "action-";

/// Map an action-queue path to its action-log twin: the terminal record for
/// `…/action/action-0000000007` lives at `…/actionlog/action-0000000007`.
pub fn actionlog_path_for(action_path: &str) -> OxherdResult<String> {
    match action_path.rfind("/action/") {
        Some(idx) => Ok(format!(
            "{}/actionlog/{}",
            &action_path[..idx],
            &action_path[idx + "/action/".len()..]
        )),
        None => Err(OxherdError::Internal(format!(
            "not an action path: {action_path}"
        ))),
    }
}

/// The tablet (or shard) root a queue path belongs to.
pub fn target_path_for(action_path: &str) -> OxherdResult<String> {
    match action_path.rfind("/action/") {
        Some(idx) => Ok(action_path[..idx].to_owned()),
        None => Err(OxherdError::Internal(format!(
            "not an action path: {action_path}"
        ))),
    }
}

/// Parse a tablet path (`/<cell>/vt/tablets/<uid>`) back into an alias.
pub fn alias_from_tablet_path(path: &str) -> OxherdResult<TabletAlias> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [cell, "vt", "tablets", uid] => {
            let uid = uid
                .parse::<u32>()
                .map_err(|e| OxherdError::Parse(format!("bad tablet uid in {path:?}: {e}")))?;
            Ok(TabletAlias::new(*cell, uid))
        }
        _ => Err(OxherdError::Parse(format!("not a tablet path: {path:?}"))),
    }
}
