//! Shard records: a controlled view of a shard, derived from its tablets.

use oxherd_errors::{OxherdError, OxherdResult};
use serde::{Deserialize, Serialize};

use crate::key::KeyRange;
use crate::tablet::{Tablet, TabletAlias, TabletType};

/// A pure data struct serialized into topology. Presents a controlled view
/// of the shard, unaware of every management action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    /// There can be at most one master, but there may be none.
    #[serde(default)]
    pub master_alias: Option<TabletAlias>,
    #[serde(default)]
    pub replica_aliases: Vec<TabletAlias>,
    #[serde(default)]
    pub rdonly_aliases: Vec<TabletAlias>,
    /// Must match the shard name by convention, but helpful decomposed.
    #[serde(default)]
    pub key_range: KeyRange,
}

impl Shard {
    /// Whether the shard's serving sets mention this tablet.
    pub fn contains(&self, tablet: &Tablet) -> bool {
        let alias = tablet.alias();
        match tablet.tablet_type {
            TabletType::Master => self.master_alias.as_ref() == Some(&alias),
            TabletType::Replica => self.replica_aliases.contains(&alias),
            TabletType::Rdonly => self.rdonly_aliases.contains(&alias),
            _ => false,
        }
    }
}

/// A shard together with its identity, the main way shard data is handled.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardInfo {
    keyspace: String,
    shard_name: String,
    pub shard: Shard,
}

impl ShardInfo {
    pub fn new(keyspace: impl Into<String>, shard_name: impl Into<String>, shard: Shard) -> Self {
        ShardInfo {
            keyspace: keyspace.into(),
            shard_name: shard_name.into(),
            shard,
        }
    }

    pub fn from_json(
        keyspace: impl Into<String>,
        shard_name: impl Into<String>,
        data: &str,
    ) -> OxherdResult<Self> {
        let shard_name: String = shard_name.into();
        if data.is_empty() {
            return Err(OxherdError::Parse(format!(
                "empty shard data for shard {shard_name}"
            )));
        }
        let shard: Shard = serde_json::from_str(data)
            .map_err(|e| OxherdError::Parse(format!("bad shard data: {e}")))?;
        Ok(ShardInfo::new(keyspace, shard_name, shard))
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn to_json(&self) -> OxherdResult<String> {
        Ok(serde_json::to_string_pretty(&self.shard)?)
    }

    /// Recompute the shard record from its member tablets. All members must
    /// agree on the key range; the serving sets are exactly the members
    /// partitioned by type.
    pub fn rebuild(&mut self, shard_tablets: &[Tablet]) -> OxherdResult<()> {
        let mut rebuilt = Shard::default();
        for (i, tablet) in shard_tablets.iter().enumerate() {
            let alias = tablet.alias();
            match tablet.tablet_type {
                TabletType::Master => {
                    if rebuilt.master_alias.is_some() {
                        return Err(OxherdError::Aborted(format!(
                            "shard {}/{} has more than one master",
                            self.keyspace, self.shard_name
                        )));
                    }
                    rebuilt.master_alias = Some(alias);
                }
                TabletType::Replica => rebuilt.replica_aliases.push(alias),
                TabletType::Rdonly => rebuilt.rdonly_aliases.push(alias),
                _ => {}
            }

            if i == 0 {
                rebuilt.key_range = tablet.key_range.clone();
            } else if rebuilt.key_range != tablet.key_range {
                return Err(OxherdError::Aborted(format!(
                    "inconsistent key range: {} != {}",
                    rebuilt.key_range, tablet.key_range
                )));
            }
        }
        self.shard = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::TabletState;

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

    #[test]
    fn rebuild_partitions_members_by_type() {
        let master = tablet(1, TabletType::Master, None);
        let parent = Some(master.alias());
        let members = vec![
            master.clone(),
            tablet(2, TabletType::Replica, parent.clone()),
            tablet(3, TabletType::Rdonly, parent.clone()),
            tablet(4, TabletType::Spare, parent.clone()),
        ];

        let mut info = ShardInfo::new("test_keyspace", "0", Shard::default());
        info.rebuild(&members).unwrap();
        assert_eq!(info.shard.master_alias, Some(master.alias()));
        assert_eq!(info.shard.replica_aliases, vec![TabletAlias::new("nyc", 2)]);
        assert_eq!(info.shard.rdonly_aliases, vec![TabletAlias::new("nyc", 3)]);

        // Rebuilding again from the same members is a no-op.
        let once = info.shard.clone();
        info.rebuild(&members).unwrap();
        assert_eq!(info.shard, once);
    }

    #[test]
    fn rebuild_rejects_mixed_key_ranges() {
        let mut odd = tablet(2, TabletType::Replica, None);
        odd.key_range = KeyRange::from_hex("", "80").unwrap();
        let members = vec![tablet(1, TabletType::Master, None), odd];

        let mut info = ShardInfo::new("test_keyspace", "0", Shard::default());
        assert!(info.rebuild(&members).is_err());
    }

    #[test]
    fn rebuild_rejects_two_masters() {
        let members = vec![
            tablet(1, TabletType::Master, None),
            tablet(2, TabletType::Master, None),
        ];
        let mut info = ShardInfo::new("test_keyspace", "0", Shard::default());
        assert!(info.rebuild(&members).is_err());
    }

    #[test]
    fn shard_json_round_trips() {
        let mut info = ShardInfo::new("test_keyspace", "0", Shard::default());
        info.rebuild(&[tablet(1, TabletType::Master, None)]).unwrap();
        let json = info.to_json().unwrap();
        let decoded = ShardInfo::from_json("test_keyspace", "0", &json).unwrap();
        assert_eq!(decoded.shard, info.shard);
    }
}
