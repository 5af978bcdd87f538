//! Hashed keyspace ids and half-open key ranges.
//!
//! Rows are routed by a 64-bit hash of their sharding key. A keyspace id is
//! the big-endian byte form of that hash; ranges compare ids by raw byte
//! order so that splitting on a hex boundary behaves the same at any id
//! width. The empty id is a sentinel: as a range start it means "from the
//! beginning", as a range end it means "to the end".

use std::fmt;

use oxherd_errors::{OxherdError, OxherdResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A point in the hashed keyspace. Byte-ordered.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyspaceId(Vec<u8>);

impl KeyspaceId {
    /// The empty sentinel id.
    pub fn none() -> Self {
        KeyspaceId(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The id for a 64-bit hash value: its big-endian bytes.
    pub fn from_u64(v: u64) -> Self {
        KeyspaceId(v.to_be_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        KeyspaceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lower-case hex form, as used in range tags and stream requests.
    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse the hex form. The empty string parses to the sentinel.
    pub fn from_hex(s: &str) -> OxherdResult<Self> {
        if s.is_empty() {
            return Ok(KeyspaceId::none());
        }
        let bytes = hex::decode(s)
            .map_err(|e| OxherdError::Parse(format!("bad hex keyspace id {s:?}: {e}")))?;
        Ok(KeyspaceId(bytes))
    }
}

impl fmt::Debug for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyspaceId({})", self.hex())
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Serialize for KeyspaceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for KeyspaceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KeyspaceId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// A half-open `[start, end)` interval of the hashed keyspace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct KeyRange {
    pub start: KeyspaceId,
    pub end: KeyspaceId,
}

impl KeyRange {
    /// The full keyspace: both bounds are the sentinel.
    pub fn all() -> Self {
        KeyRange::default()
    }

    pub fn new(start: KeyspaceId, end: KeyspaceId) -> Self {
        KeyRange { start, end }
    }

    /// Parse a pair of hex bounds.
    pub fn from_hex(start: &str, end: &str) -> OxherdResult<Self> {
        Ok(KeyRange {
            start: KeyspaceId::from_hex(start)?,
            end: KeyspaceId::from_hex(end)?,
        })
    }

    /// True when the range covers the entire keyspace.
    pub fn is_complete(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Half-open containment; the empty end bound is unbounded.
    pub fn contains(&self, id: &KeyspaceId) -> bool {
        &self.start <= id && (self.end.is_empty() || id < &self.end)
    }

    /// The tag used to key per-subscriber statistics: the hex of the end
    /// bound, or `MAX_KEY` for an unbounded range.
    pub fn tag(&self) -> String {
        if self.end.is_empty() {
            "MAX_KEY".to_owned()
        } else {
            self.end.hex()
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start.hex(), self.end.hex())
    }
}

/// Verify that `ranges` forms a gapless, non-overlapping partition of the
/// keyspace. The input is sorted by start bound first.
pub fn validate_partition(ranges: &[KeyRange]) -> OxherdResult<()> {
    if ranges.is_empty() {
        return Err(OxherdError::Aborted("keyspace has no shards".into()));
    }
    let mut sorted: Vec<&KeyRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start));

    if !sorted[0].start.is_empty() {
        return Err(OxherdError::Aborted(format!(
            "keyspace does not start at the beginning: first range {}",
            sorted[0]
        )));
    }
    for pair in sorted.windows(2) {
        if pair[0].end.is_empty() || pair[0].end != pair[1].start {
            return Err(OxherdError::Aborted(format!(
                "keyspace has a gap or overlap between {} and {}",
                pair[0], pair[1]
            )));
        }
    }
    let last = sorted[sorted.len() - 1];
    if !last.end.is_empty() {
        return Err(OxherdError::Aborted(format!(
            "keyspace does not extend to the end: last range {last}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kid(b: &[u8]) -> KeyspaceId {
        KeyspaceId::from_bytes(b.to_vec())
    }

    #[test]
    fn contains_is_half_open() {
        let range = KeyRange::new(kid(&[0x80]), kid(&[0xc0]));
        assert!(!range.contains(&kid(&[0x7f])));
        assert!(range.contains(&kid(&[0x80])));
        assert!(range.contains(&kid(&[0xa0, 0x00])));
        assert!(!range.contains(&kid(&[0xc0])));
    }

    #[test]
    fn unbounded_end_contains_everything_above_start() {
        let range = KeyRange::new(kid(&[0x80]), KeyspaceId::none());
        assert!(range.contains(&kid(&[0xff, 0xff])));
        assert!(!range.contains(&kid(&[0x10])));
        assert_eq!(range.tag(), "MAX_KEY");
    }

    #[test]
    fn u64_ids_order_like_their_values() {
        assert!(KeyspaceId::from_u64(0x4000000000000000) < KeyspaceId::from_u64(0xa000000000000000));
        assert_eq!(KeyspaceId::from_u64(0x80 << 56).hex(), "8000000000000000");
    }

    #[test]
    fn hex_round_trip() {
        let id = KeyspaceId::from_u64(0xdeadbeef12345678);
        assert_eq!(KeyspaceId::from_hex(&id.hex()).unwrap(), id);
        assert_eq!(KeyspaceId::from_hex("").unwrap(), KeyspaceId::none());
        assert!(KeyspaceId::from_hex("zz").is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let range = KeyRange::from_hex("80", "c0").unwrap();
        let encoded = serde_json::to_string(&range).unwrap();
        assert_eq!(encoded, r#"{"start":"80","end":"c0"}"#);
        let decoded: KeyRange = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, range);
    }

    #[test]
    fn partition_validation() {
        let full = vec![KeyRange::all()];
        validate_partition(&full).unwrap();

        let split = vec![
            KeyRange::from_hex("", "80").unwrap(),
            KeyRange::from_hex("80", "").unwrap(),
        ];
        validate_partition(&split).unwrap();

        let gap = vec![
            KeyRange::from_hex("", "40").unwrap(),
            KeyRange::from_hex("80", "").unwrap(),
        ];
        assert!(validate_partition(&gap).is_err());

        let truncated = vec![KeyRange::from_hex("", "80").unwrap()];
        assert!(validate_partition(&truncated).is_err());
    }
}
