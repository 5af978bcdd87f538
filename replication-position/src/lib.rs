//! Data types for positions within MySQL replication logs.
//!
//! A coordinate names a byte offset inside a master binlog, optionally
//! paired with a relay-log location when the stream is served off a
//! replica. Subscribers hand positions around as opaque strings; this crate
//! owns the encoding.

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use oxherd_errors::{OxherdError, OxherdResult};
use serde::{Deserialize, Serialize};

/// A position in the replication stream: master binlog file and offset,
/// plus the relay-log location when streaming from a replica's local logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCoordinates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_filename: Option<String>,
    #[serde(default)]
    pub relay_offset: u64,
    pub master_filename: String,
    pub master_offset: u64,
}

impl ReplicationCoordinates {
    pub fn new(master_filename: impl Into<String>, master_offset: u64) -> Self {
        ReplicationCoordinates {
            relay_filename: None,
            relay_offset: 0,
            master_filename: master_filename.into(),
            master_offset,
        }
    }

    pub fn with_relay(mut self, relay_filename: impl Into<String>, relay_offset: u64) -> Self {
        self.relay_filename = Some(relay_filename.into());
        self.relay_offset = relay_offset;
        self
    }

    /// True when the position names a relay log, which selects relay-log
    /// mode in the binlog streamer.
    pub fn uses_relay_logs(&self) -> bool {
        self.relay_filename.is_some()
    }
}

impl fmt::Display for ReplicationCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.master_filename, self.master_offset)
    }
}

/// Compare two log filenames of the form `<basename>.<NNNNNN>` by their
/// numeric suffix. Different basenames (or malformed names) do not compare.
pub fn compare_log_filenames(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    let (basename, suffix) = a.rsplit_once('.')?;
    let (other_basename, other_suffix) = b.rsplit_once('.')?;
    if basename != other_basename {
        return None;
    }
    let suffix = suffix.parse::<u64>().ok()?;
    let other_suffix = other_suffix.parse::<u64>().ok()?;
    suffix.partial_cmp(&other_suffix)
}

impl PartialOrd for ReplicationCoordinates {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match compare_log_filenames(&self.master_filename, &other.master_filename)? {
            Ordering::Equal => self.master_offset.partial_cmp(&other.master_offset),
            unequal => Some(unequal),
        }
    }
}

/// Encode coordinates into the opaque position string carried by stream
/// requests and responses.
pub fn encode_position(coords: &ReplicationCoordinates) -> OxherdResult<String> {
    let json = serde_json::to_vec(coords)?;
    Ok(BASE64.encode(json))
}

/// Decode an opaque position string back into coordinates.
pub fn decode_position(position: &str) -> OxherdResult<ReplicationCoordinates> {
    let bytes = BASE64
        .decode(position)
        .map_err(|e| OxherdError::Parse(format!("bad position encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OxherdError::Parse(format!("bad position payload: {e}")))
}

/// What a master reports about its own binlog head.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationPosition {
    pub master_log_file: String,
    pub master_log_position: u64,
    #[serde(default)]
    pub seconds_behind_master: u64,
}

impl ReplicationPosition {
    pub fn map_key(&self) -> String {
        format!("{}:{}", self.master_log_file, self.master_log_position)
    }
}

/// Everything a slave needs to attach to a master.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationState {
    /// `host:port` of the master to replicate from.
    pub master_addr: String,
    pub replication_position: ReplicationPosition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_suffix_ordering() {
        assert_eq!(
            compare_log_filenames("vt-bin.000001", "vt-bin.000002"),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_log_filenames("vt-bin.000010", "vt-bin.000002"),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_log_filenames("vt-bin.000002", "vt-bin.000002"),
            Some(Ordering::Equal)
        );
        assert_eq!(compare_log_filenames("a-bin.000001", "b-bin.000001"), None);
        assert_eq!(compare_log_filenames("nodots", "b-bin.000001"), None);
    }

    #[test]
    fn coordinates_order_within_and_across_files() {
        let early = ReplicationCoordinates::new("vt-bin.000003", 100);
        let later = ReplicationCoordinates::new("vt-bin.000003", 900);
        let next_file = ReplicationCoordinates::new("vt-bin.000004", 4);
        assert!(early < later);
        assert!(later < next_file);
    }

    #[test]
    fn position_round_trips() {
        let coords = ReplicationCoordinates::new("vt-bin.000007", 12345);
        let decoded = decode_position(&encode_position(&coords).unwrap()).unwrap();
        assert_eq!(decoded, coords);

        let with_relay =
            ReplicationCoordinates::new("vt-bin.000007", 12345).with_relay("relay.000002", 88);
        let decoded = decode_position(&encode_position(&with_relay).unwrap()).unwrap();
        assert_eq!(decoded, with_relay);
        assert!(decoded.uses_relay_logs());
    }

    #[test]
    fn junk_positions_are_parse_errors() {
        assert!(matches!(
            decode_position("!!!"),
            Err(OxherdError::Parse(_))
        ));
        let not_json = BASE64.encode(b"hello");
        assert!(matches!(
            decode_position(&not_json),
            Err(OxherdError::Parse(_))
        ));
    }
}
