//! Records delivered on a subscriber stream.

use oxherd_errors::OxherdResult;
use replication_position::{encode_position, ReplicationCoordinates};
use serde::{Deserialize, Serialize};

/// A position plus the transaction metadata accumulated while parsing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinlogPosition {
    pub coordinates: ReplicationCoordinates,
    pub timestamp: i64,
    pub xid: u64,
}

/// The kind of statement a stream record carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamEventKind {
    Begin,
    Commit,
    Ddl,
    Insert,
    Update,
    Delete,
    Error,
}

impl StreamEventKind {
    pub fn from_dml_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "insert" => Some(StreamEventKind::Insert),
            "update" => Some(StreamEventKind::Update),
            "delete" => Some(StreamEventKind::Delete),
            _ => None,
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            StreamEventKind::Insert | StreamEventKind::Update | StreamEventKind::Delete
        )
    }
}

/// A primary-key value extracted from a stream comment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
}

/// One record on the subscriber stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinlogRecord {
    /// Set on the final record of a failed stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque encoded coordinate; decodes back to file + offset.
    pub binlog_position: String,
    pub timestamp: i64,
    pub xid: u64,
    pub sql_type: Option<StreamEventKind>,
    /// Statement text; the full DDL, or the buffered lines of a DML.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sql: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyspace_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pk_col_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pk_values: Vec<Vec<PkValue>>,
}

impl BinlogRecord {
    /// A record of `kind` stamped with `position`.
    pub fn at(kind: StreamEventKind, position: &BinlogPosition) -> OxherdResult<Self> {
        Ok(BinlogRecord {
            binlog_position: encode_position(&position.coordinates)?,
            timestamp: position.timestamp,
            xid: position.xid,
            sql_type: Some(kind),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_compactly() {
        let position = BinlogPosition {
            coordinates: ReplicationCoordinates::new("vt-bin.000003", 120),
            timestamp: 1700000000,
            xid: 7,
        };
        let record = BinlogRecord::at(StreamEventKind::Begin, &position).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""sql_type":"BEGIN""#));
        assert!(!json.contains("pk_col_names"), "empty fields omitted: {json}");

        let decoded: BinlogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn pk_values_keep_their_shapes() {
        let values = vec![
            PkValue::Int(-3),
            PkValue::Uint(18446744073709551615),
            PkValue::Str("name".into()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[-3,18446744073709551615,"name"]"#);
    }
}
