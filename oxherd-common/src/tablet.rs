//! Tablet records: a managed MySQL instance plus its sidecar agent.

use std::fmt;
use std::str::FromStr;

use oxherd_errors::{OxherdError, OxherdResult};
use serde::{Deserialize, Serialize};

use crate::key::KeyRange;

/// The role a tablet currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletType {
    /// Provisioned but not assigned to any keyspace/shard.
    Idle,
    /// The writable head of a shard.
    Master,
    /// A serving replica eligible for promotion.
    Replica,
    /// A read-only serving replica.
    Rdonly,
    /// A replica dedicated to batch jobs.
    Batch,
    /// In the replication graph but not serving; hot standby.
    Spare,
    /// Detached for snapshotting.
    Backup,
    /// Receiving a snapshot.
    Restore,
    /// Intentionally lagged replica.
    Lag,
    /// A lagged replica orphaned by a reparent; rejoins once caught up.
    LagOrphan,
    /// Terminal: decommissioned.
    Scrap,
}

impl TabletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletType::Idle => "idle",
            TabletType::Master => "master",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Batch => "batch",
            TabletType::Spare => "spare",
            TabletType::Backup => "backup",
            TabletType::Restore => "restore",
            TabletType::Lag => "lag",
            TabletType::LagOrphan => "lag_orphan",
            TabletType::Scrap => "scrap",
        }
    }

    /// A tablet is in the replication graph unless idle or scrapped.
    pub fn is_in_replication_graph(&self) -> bool {
        !matches!(self, TabletType::Idle | TabletType::Scrap)
    }

    /// Serving types appear in the per-cell serving graph.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            TabletType::Master | TabletType::Replica | TabletType::Rdonly | TabletType::Batch
        )
    }

    /// True for any type that replicates from a master.
    pub fn is_slave(&self) -> bool {
        self.is_in_replication_graph() && !matches!(self, TabletType::Master)
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type changes agents may perform on their own, without a coordinator
/// holding the shard lock.
pub fn is_trivial_type_change(old: TabletType, new: TabletType) -> bool {
    use TabletType::*;
    match old {
        Replica | Rdonly | Batch | Spare | Lag | LagOrphan | Backup => {
            matches!(
                new,
                Replica | Rdonly | Batch | Spare | Lag | LagOrphan | Backup
            )
        }
        Scrap => new == Idle,
        Idle => new == Restore,
        Restore => new == Spare,
        Master => false,
    }
}

/// A tablet identity: `(cell, uid)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        TabletAlias {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = OxherdError;

    fn from_str(s: &str) -> OxherdResult<Self> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| OxherdError::Parse(format!("bad tablet alias {s:?}")))?;
        let uid = uid
            .parse::<u32>()
            .map_err(|e| OxherdError::Parse(format!("bad tablet uid in {s:?}: {e}")))?;
        Ok(TabletAlias::new(cell, uid))
    }
}

/// Whether the underlying MySQL accepts writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    ReadOnly,
    ReadWrite,
}

/// The authoritative record for one tablet, stored in topology.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tablet {
    pub cell: String,
    pub uid: u32,
    /// The master this tablet replicates from. Empty iff master or idle.
    #[serde(default)]
    pub parent: Option<TabletAlias>,
    /// Agent network address, `host:port`.
    pub addr: String,
    /// MySQL address, `host:port`.
    pub mysql_addr: String,
    /// MySQL address with the host resolved to an IP.
    pub mysql_ip_addr: String,
    #[serde(default)]
    pub keyspace: String,
    #[serde(default)]
    pub shard: String,
    #[serde(rename = "type")]
    pub tablet_type: TabletType,
    pub state: TabletState,
    #[serde(default)]
    pub key_range: KeyRange,
}

impl Tablet {
    pub fn alias(&self) -> TabletAlias {
        TabletAlias::new(self.cell.clone(), self.uid)
    }

    pub fn is_in_replication_graph(&self) -> bool {
        self.tablet_type.is_in_replication_graph()
    }

    pub fn is_serving_type(&self) -> bool {
        self.tablet_type.is_serving()
    }

    pub fn is_slave_type(&self) -> bool {
        self.tablet_type.is_slave()
    }

    /// The MySQL database that holds this keyspace's tables.
    pub fn db_name(&self) -> String {
        format!("vt_{}", self.keyspace)
    }

    /// The tablet's path in the replication graph, relative to the shard's
    /// replication root: masters sit at the root, slaves under their
    /// master's alias.
    pub fn replication_path(&self) -> String {
        match &self.parent {
            None => self.alias().to_string(),
            Some(parent) => format!("{}/{}", parent, self.alias()),
        }
    }

    /// Unassign from the keyspace/shard; used when a tablet goes idle.
    pub fn clear_assignment(&mut self) {
        self.parent = None;
        self.keyspace.clear();
        self.shard.clear();
        self.key_range = KeyRange::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(tablet_type: TabletType, parent: Option<TabletAlias>) -> Tablet {
        Tablet {
            cell: "nyc".into(),
            uid: 42,
            parent,
            addr: "host:8080".into(),
            mysql_addr: "host:3306".into(),
            mysql_ip_addr: "10.0.0.1:3306".into(),
            keyspace: "test_keyspace".into(),
            shard: "0".into(),
            tablet_type,
            state: TabletState::ReadOnly,
            key_range: KeyRange::all(),
        }
    }

    #[test]
    fn alias_format_round_trips() {
        let alias = TabletAlias::new("nyc", 42);
        assert_eq!(alias.to_string(), "nyc-0000000042");
        assert_eq!("nyc-0000000042".parse::<TabletAlias>().unwrap(), alias);
        assert!("junk".parse::<TabletAlias>().is_err());
    }

    #[test]
    fn replication_graph_membership() {
        assert!(!tablet(TabletType::Idle, None).is_in_replication_graph());
        assert!(!tablet(TabletType::Scrap, None).is_in_replication_graph());
        assert!(tablet(TabletType::Spare, None).is_in_replication_graph());
        assert!(tablet(TabletType::Master, None).is_in_replication_graph());
    }

    #[test]
    fn replication_path_nests_slaves_under_master() {
        let master = tablet(TabletType::Master, None);
        assert_eq!(master.replication_path(), "nyc-0000000042");

        let slave = tablet(TabletType::Replica, Some(TabletAlias::new("nyc", 7)));
        assert_eq!(
            slave.replication_path(),
            "nyc-0000000007/nyc-0000000042"
        );
    }

    #[test]
    fn trivial_type_changes() {
        use TabletType::*;
        assert!(is_trivial_type_change(Replica, Spare));
        assert!(is_trivial_type_change(Lag, LagOrphan));
        assert!(is_trivial_type_change(Backup, Spare));
        assert!(is_trivial_type_change(Replica, Backup));
        assert!(is_trivial_type_change(Restore, Spare));
        assert!(!is_trivial_type_change(Replica, Master));
        assert!(!is_trivial_type_change(Master, Replica));
        assert!(!is_trivial_type_change(Idle, Replica));
    }

    #[test]
    fn tablet_json_round_trips() {
        let t = tablet(TabletType::Replica, Some(TabletAlias::new("nyc", 7)));
        let encoded = serde_json::to_string(&t).unwrap();
        let decoded: Tablet = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, t);
    }
}
