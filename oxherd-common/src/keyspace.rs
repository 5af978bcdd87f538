//! Keyspace records: the list of shards partitioning a logical database.

use oxherd_errors::OxherdResult;
use serde::{Deserialize, Serialize};

use crate::key::{validate_partition, KeyRange};

/// One shard entry inside a keyspace record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyspaceShard {
    pub name: String,
    pub key_range: KeyRange,
}

/// The rolled-up view of a keyspace, derived from its shards by a rebuild.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Keyspace {
    pub shards: Vec<KeyspaceShard>,
}

impl Keyspace {
    /// Verify the shard ranges form a gapless non-overlapping partition.
    pub fn check_partition(&self) -> OxherdResult<()> {
        let ranges: Vec<KeyRange> = self.shards.iter().map(|s| s.key_range.clone()).collect();
        validate_partition(&ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_check_covers_shard_list() {
        let keyspace = Keyspace {
            shards: vec![
                KeyspaceShard {
                    name: "-80".into(),
                    key_range: KeyRange::from_hex("", "80").unwrap(),
                },
                KeyspaceShard {
                    name: "80-".into(),
                    key_range: KeyRange::from_hex("80", "").unwrap(),
                },
            ],
        };
        keyspace.check_partition().unwrap();

        let broken = Keyspace {
            shards: vec![KeyspaceShard {
                name: "-80".into(),
                key_range: KeyRange::from_hex("", "80").unwrap(),
            }],
        };
        assert!(broken.check_partition().is_err());
    }
}
