//! Snapshot manifests and schema descriptions.
//!
//! A snapshot produces a manifest describing the data files, their hashes,
//! and the replication position they correspond to; restore consumes the
//! manifest verbatim. Transport of the files themselves (HTTP fetch + hash
//! verification) is an external collaborator reached through
//! [`ManifestFetcher`].

use async_trait::async_trait;
use oxherd_common::KeyRange;
use oxherd_errors::OxherdResult;
use replication_position::ReplicationPosition;
use serde::{Deserialize, Serialize};

/// Name of the manifest file inside a snapshot directory.
pub const SNAPSHOT_MANIFEST_FILE: &str = "snapshot_manifest.json";
/// Name of the manifest file inside a partial-snapshot directory.
pub const PARTIAL_SNAPSHOT_MANIFEST_FILE: &str = "partial_snapshot_manifest.json";

/// One data file inside a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotFile {
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub table_name: String,
}

/// Everything a restore needs to clone a source tablet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotManifest {
    /// Agent address of the snapshot source, `host:port`.
    pub addr: String,
    /// MySQL address of the snapshot source.
    pub mysql_addr: String,
    pub db_name: String,
    pub files: Vec<SnapshotFile>,
    pub replication_position: ReplicationPosition,
    /// The master to attach to after restoring.
    pub master_addr: String,
}

/// A version-stamped schema dump.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaDefinition {
    pub database_schema: String,
    pub table_definitions: Vec<TableDefinition>,
    /// Fingerprint over the normalized schema.
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDefinition {
    pub name: String,
    pub schema: String,
    pub columns: Vec<String>,
}

/// A schema change to apply, with safety rails.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaChange {
    pub sql: String,
    pub force: bool,
    pub allow_replication: bool,
    /// Expected schema version before the change; empty skips the check.
    pub before_schema_version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaChangeResult {
    pub before_schema: SchemaDefinition,
    pub after_schema: SchemaDefinition,
}

/// A snapshot restricted to one key range, with the schema needed to
/// recreate the tables on the target.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitSnapshotManifest {
    pub source: SnapshotManifest,
    pub key_range: KeyRange,
    pub schema_definition: SchemaDefinition,
}

/// Checks that a set of split manifests can be restored together.
pub fn sanity_check_manifests(manifests: &[SplitSnapshotManifest]) -> OxherdResult<()> {
    if let Some(first) = manifests.first() {
        for manifest in &manifests[1..] {
            if manifest.schema_definition.version != first.schema_definition.version {
                return Err(oxherd_errors::OxherdError::Aborted(format!(
                    "schema versions do not match: {} vs {}",
                    manifest.schema_definition.version, first.schema_definition.version
                )));
            }
        }
    }
    Ok(())
}

/// Fetches a manifest (or any small JSON file) from another tablet's data
/// server. The real implementation does an HTTP fetch with hash checking;
/// tests use an in-memory map.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Fetch `file_path` from the tablet serving at `addr`.
    async fn fetch(&self, addr: &str, file_path: &str) -> OxherdResult<Vec<u8>>;
}

/// Fetch and decode a JSON document.
pub async fn fetch_json<T: serde::de::DeserializeOwned>(
    fetcher: &dyn ManifestFetcher,
    addr: &str,
    file_path: &str,
) -> OxherdResult<T> {
    let bytes = fetcher.fetch(addr, file_path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_manifest_round_trips() {
        let manifest = SplitSnapshotManifest {
            source: SnapshotManifest {
                addr: "host1:8080".into(),
                mysql_addr: "host1:3306".into(),
                db_name: "vt_test_keyspace".into(),
                files: vec![SnapshotFile {
                    path: "data/vt_test_keyspace/moves.csv".into(),
                    size: 123,
                    hash: "abcd".into(),
                    table_name: "moves".into(),
                }],
                replication_position: ReplicationPosition {
                    master_log_file: "vt-bin.000003".into(),
                    master_log_position: 42,
                    seconds_behind_master: 0,
                },
                master_addr: "host0:3306".into(),
            },
            key_range: KeyRange::from_hex("", "80").unwrap(),
            schema_definition: SchemaDefinition {
                version: "v1".into(),
                ..Default::default()
            },
        };
        let encoded = serde_json::to_string_pretty(&manifest).unwrap();
        let decoded: SplitSnapshotManifest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn mismatched_schema_versions_fail_sanity_check() {
        let mk = |version: &str| SplitSnapshotManifest {
            schema_definition: SchemaDefinition {
                version: version.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        sanity_check_manifests(&[mk("v1"), mk("v1")]).unwrap();
        assert!(sanity_check_manifests(&[mk("v1"), mk("v2")]).is_err());
        sanity_check_manifests(&[]).unwrap();
    }
}
