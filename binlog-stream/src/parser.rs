//! Line-level parsing of text binlogs into transaction-batched streams.
//!
//! The input is the text form of a binlog (as produced by the MySQL binlog
//! text decoder). Comment lines carry positions and rotations; statement
//! lines accumulate into the current transaction until `COMMIT`, at which
//! point the buffered DMLs are filtered by the subscriber's key range and
//! delivered as one `BEGIN … COMMIT` batch stamped with the commit
//! coordinate. Rolled-back transactions are never partially visible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use oxherd_common::{KeyRange, KeyspaceId};
use oxherd_errors::{OxherdError, OxherdResult};
use replication_position::{compare_log_filenames, ReplicationCoordinates};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::events::{BinlogPosition, BinlogRecord, StreamEventKind};
use crate::stream_comment::{parse_stream_comment, resolve_pk_values, STREAM_COMMENT_START};

const BINLOG_DELIMITER: &str = "/*!*/;";
const POSITION_PREFIX: &str = "# at ";
const ROTATE_TO: &str = "Rotate to ";
const ROTATE_POS: &str = " pos: ";
const END_LOG_POS: &str = "end_log_pos ";
const FORMAT_DESCRIPTION: &str = "Start: binlog";
const XID: &str = "Xid = ";
const SET_TIMESTAMP: &str = "SET TIMESTAMP=";
const SET_INSERT_ID: &str = "SET INSERT_ID=";
const DB_CHANGE: &str = "use ";
const KEYSPACE_ID_COMMENT: &str = "/* EMD keyspace_id:";
const USER_ID: &str = "user_id";

/// How a relay-mode parser observes the local replica's apply progress.
#[async_trait]
pub trait ApplyMonitor: Send + Sync {
    /// The master coordinate the local replica has applied up to.
    async fn applied_position(&self) -> OxherdResult<ReplicationCoordinates>;

    /// Block until the replica has applied at least `position`.
    async fn wait_applied(
        &self,
        position: &ReplicationCoordinates,
        timeout: Duration,
    ) -> OxherdResult<()>;
}

/// Static configuration for one parser instance.
pub struct ParserConfig {
    /// Database the subscriber cares about; empty matches everything.
    pub dbname: String,
    pub key_range: KeyRange,
    pub start_position: ReplicationCoordinates,
    /// Set when tailing a replica's relay logs instead of a master binlog.
    pub using_relay_logs: bool,
}

struct EventLine {
    position: BinlogPosition,
    text: String,
    first_keyword: String,
}

enum SqlKind {
    Ddl,
    Dml(&'static str),
    Begin,
    Commit,
    Other,
}

fn classify_keyword(keyword: &str) -> SqlKind {
    match keyword {
        "create" | "alter" | "drop" | "truncate" | "rename" => SqlKind::Ddl,
        "insert" => SqlKind::Dml("insert"),
        "update" => SqlKind::Dml("update"),
        "delete" => SqlKind::Dml("delete"),
        "begin" => SqlKind::Begin,
        "commit" => SqlKind::Commit,
        _ => SqlKind::Other,
    }
}

/// Statements that show up in binlogs but carry nothing for subscribers.
fn is_ignored_statement(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    lowered.starts_with("set ")
        || lowered.starts_with("delimiter")
        || lowered.starts_with("/*!")
        || lowered.starts_with("binlog ")
}

/// Whether a statement belongs inside the transaction buffer.
fn is_txn_statement(line: &str, keyword: &str) -> bool {
    matches!(classify_keyword(keyword), SqlKind::Dml(_))
        || line.starts_with(SET_TIMESTAMP)
        || line.starts_with(SET_INSERT_ID)
}

/// One subscriber's parsing session.
pub struct BinlogParser {
    config: ParserConfig,
    keyrange_tag: String,

    next_stmt_position: u64,
    in_txn: bool,
    txn_buffer: Vec<EventLine>,
    initial_seek: bool,
    current_position: BinlogPosition,
    db_match: bool,

    apply_monitor: Option<Arc<dyn ApplyMonitor>>,
    /// Milliseconds to sleep after each delivered transaction; set by the
    /// server's throttle ticker.
    sleep_to_throttle_ms: Arc<AtomicU64>,
    /// Total DMLs delivered, read by the throttle ticker.
    dml_count: Arc<AtomicU64>,
    txn_count: Arc<AtomicU64>,
}

impl BinlogParser {
    pub fn new(config: ParserConfig) -> Self {
        let current_position = BinlogPosition {
            coordinates: ReplicationCoordinates {
                relay_filename: config.start_position.relay_filename.clone(),
                relay_offset: 0,
                master_filename: config.start_position.master_filename.clone(),
                master_offset: config.start_position.master_offset,
            },
            timestamp: 0,
            xid: 0,
        };
        let keyrange_tag = config.key_range.tag();
        BinlogParser {
            config,
            keyrange_tag,
            next_stmt_position: 0,
            in_txn: false,
            txn_buffer: Vec::new(),
            initial_seek: true,
            current_position,
            db_match: true,
            apply_monitor: None,
            sleep_to_throttle_ms: Arc::new(AtomicU64::new(0)),
            dml_count: Arc::new(AtomicU64::new(0)),
            txn_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_apply_monitor(mut self, monitor: Arc<dyn ApplyMonitor>) -> Self {
        self.apply_monitor = Some(monitor);
        self
    }

    /// Shared handles the server's throttle ticker reads and writes.
    pub fn throttle_handles(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>, Arc<AtomicU64>) {
        (
            Arc::clone(&self.dml_count),
            Arc::clone(&self.txn_count),
            Arc::clone(&self.sleep_to_throttle_ms),
        )
    }

    pub fn current_position(&self) -> &BinlogPosition {
        &self.current_position
    }

    /// Consume text-binlog lines and deliver records to `sender` until the
    /// input ends or a parse error occurs. A closed subscriber terminates
    /// the session with an error.
    pub async fn parse_binlog_stream<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: R,
        sender: &mpsc::Sender<BinlogRecord>,
    ) -> OxherdResult<()> {
        let mut lines = reader.lines();
        // Statements can span lines; accumulate until the delimiter.
        let mut pending: Option<EventLine> = None;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("binlog input ended");
                    return Ok(());
                }
                Err(e) => return Err(OxherdError::Parse(format!("read error: {e}"))),
            };
            if line.is_empty() {
                continue;
            }

            if line.starts_with('#') {
                self.parse_position_data(line.trim())?;
                continue;
            }

            // This accounts for replicas where the seek lands before the
            // desired start position.
            if self.initial_seek
                && self.config.using_relay_logs
                && self.next_stmt_position < self.config.start_position.master_offset
            {
                continue;
            }

            let mut event = match pending.take() {
                Some(mut event) => {
                    event.text.push('\n');
                    event.text.push_str(&line);
                    event
                }
                None => EventLine {
                    position: self.current_position.clone(),
                    text: line,
                    first_keyword: String::new(),
                },
            };

            match event.text.rfind(BINLOG_DELIMITER) {
                Some(idx) => {
                    event.text.truncate(idx);
                    let trimmed = event.text.trim();
                    event.text = trimmed.to_owned();
                }
                None => {
                    pending = Some(event);
                    continue;
                }
            }
            event.first_keyword = event
                .text
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();

            self.parse_db_change(&event);
            self.parse_event_data(event, sender).await?;
        }
    }

    /// Track `use <db>` so statements for other databases are skipped.
    fn parse_db_change(&mut self, event: &EventLine) {
        if event.first_keyword != "use" {
            return;
        }
        if self.config.dbname.is_empty() {
            warn!("dbname not set, matching all databases");
            return;
        }
        let new_db = event.text[DB_CHANGE.len().min(event.text.len())..].trim();
        self.db_match = new_db == self.config.dbname;
    }

    fn parse_position_data(&mut self, line: &str) -> OxherdResult<()> {
        if line.starts_with(POSITION_PREFIX) {
            // The master offset is taken from end_log_pos instead.
        } else if line.contains(ROTATE_TO) {
            self.parse_rotate_event(line)?;
        } else if line.contains(END_LOG_POS) {
            // The format-description line at the head of each binlog also
            // carries end_log_pos; it is not a statement position.
            if line.contains(FORMAT_DESCRIPTION) {
                return Ok(());
            }
            self.parse_master_position(line)?;
            if self.next_stmt_position != 0 {
                self.current_position.coordinates.master_offset = self.next_stmt_position;
            }
        }
        if line.contains(XID) {
            self.parse_xid(line)?;
        }
        Ok(())
    }

    fn parse_master_position(&mut self, line: &str) -> OxherdResult<()> {
        let rest = line
            .split(END_LOG_POS)
            .nth(1)
            .ok_or_else(|| OxherdError::Parse(format!("bad end_log_pos line {line:?}")))?;
        let position = rest.split_whitespace().next().unwrap_or_default();
        self.next_stmt_position = position.parse::<u64>().map_err(|e| {
            OxherdError::Parse(format!("cannot extract master position from {line:?}: {e}"))
        })?;
        Ok(())
    }

    fn parse_xid(&mut self, line: &str) -> OxherdResult<()> {
        let rest = line
            .split(XID)
            .nth(1)
            .ok_or_else(|| OxherdError::Parse(format!("bad Xid line {line:?}")))?;
        self.current_position.xid = rest.trim().parse::<u64>().map_err(|e| {
            OxherdError::Parse(format!("cannot extract xid from {line:?}: {e}"))
        })?;
        Ok(())
    }

    fn parse_rotate_event(&mut self, line: &str) -> OxherdResult<()> {
        let rest = line
            .split(ROTATE_TO)
            .nth(1)
            .ok_or_else(|| OxherdError::Parse(format!("bad rotate line {line:?}")))?;
        let (filename, position) = rest
            .split_once(ROTATE_POS)
            .ok_or_else(|| OxherdError::Parse(format!("bad rotate line {line:?}")))?;
        let filename = filename.trim();
        let position = position.trim().parse::<u64>().map_err(|e| {
            OxherdError::Parse(format!("cannot extract rotate pos from {line:?}: {e}"))
        })?;

        if !self.config.using_relay_logs {
            // When parsing a binlog directly, rotate events only ever refer
            // to the binlog itself.
            self.current_position.coordinates.master_filename = filename.to_owned();
            self.current_position.coordinates.master_offset = position;
            counter!("binlog_rotate", "keyrange" => self.keyrange_tag.clone()).increment(1);
        } else {
            // In a relay log, the rotate may be the relay log's own or the
            // master's; the filename prefix distinguishes them.
            let current_relay = self
                .current_position
                .coordinates
                .relay_filename
                .clone()
                .unwrap_or_default();
            let relay_leaf = current_relay.rsplit('/').next().unwrap_or("");
            let current_prefix = relay_leaf.split('.').next().unwrap_or("");
            let rotate_prefix = filename.split('.').next().unwrap_or("");
            if current_prefix == rotate_prefix {
                let dir = match current_relay.rsplit_once('/') {
                    Some((dir, _)) => format!("{dir}/{filename}"),
                    None => filename.to_owned(),
                };
                self.current_position.coordinates.relay_filename = Some(dir);
                counter!("relay_rotate", "keyrange" => self.keyrange_tag.clone()).increment(1);
            } else {
                self.current_position.coordinates.master_filename = filename.to_owned();
                self.current_position.coordinates.master_offset = position;
                counter!("binlog_rotate", "keyrange" => self.keyrange_tag.clone()).increment(1);
            }
        }
        Ok(())
    }

    async fn parse_event_data(
        &mut self,
        event: EventLine,
        sender: &mpsc::Sender<BinlogRecord>,
    ) -> OxherdResult<()> {
        if event.text.starts_with(SET_TIMESTAMP) {
            self.extract_event_timestamp(&event)?;
            self.initial_seek = false;
            if self.in_txn {
                self.txn_buffer.push(event);
            }
        } else if event.first_keyword == "begin" {
            self.handle_begin_event(event)?;
        } else if event.first_keyword == "rollback" {
            self.in_txn = false;
            self.txn_buffer.clear();
        } else if event.first_keyword == "commit" {
            self.handle_commit_event(event, sender).await?;
            self.in_txn = false;
            self.txn_buffer.clear();
        } else if !event.text.is_empty() {
            match classify_keyword(&event.first_keyword) {
                _ if self.in_txn && is_txn_statement(&event.text, &event.first_keyword) => {
                    self.txn_buffer.push(event);
                }
                SqlKind::Ddl => self.handle_ddl_event(event, sender).await?,
                SqlKind::Dml(_) => {
                    return Err(OxherdError::Parse(format!(
                        "DML outside a transaction: {:?}",
                        event.text
                    )));
                }
                _ => {
                    if !is_ignored_statement(&event.text) {
                        warn!(statement = %event.text, "unknown statement");
                    }
                }
            }
        }
        Ok(())
    }

    fn extract_event_timestamp(&mut self, event: &EventLine) -> OxherdResult<()> {
        let text = &event.text[SET_TIMESTAMP.len()..];
        let timestamp = text.parse::<i64>().map_err(|e| {
            OxherdError::Parse(format!("cannot extract timestamp from {:?}: {e}", event.text))
        })?;
        self.current_position.timestamp = timestamp;
        Ok(())
    }

    fn handle_begin_event(&mut self, event: EventLine) -> OxherdResult<()> {
        if !self.txn_buffer.is_empty() {
            if self.in_txn {
                return Err(OxherdError::Parse(format!(
                    "BEGIN with a non-empty transaction buffer, len {}",
                    self.txn_buffer.len()
                )));
            }
            warn!("non-empty transaction buffer while not in a transaction");
            self.txn_buffer.clear();
        }
        self.in_txn = true;
        self.txn_buffer.push(event);
        Ok(())
    }

    async fn handle_ddl_event(
        &mut self,
        event: EventLine,
        sender: &mpsc::Sender<BinlogRecord>,
    ) -> OxherdResult<()> {
        if !self.db_match {
            return Ok(());
        }
        let mut record = BinlogRecord::at(StreamEventKind::Ddl, &event.position)?;
        record.sql = vec![event.text];
        send_records(sender, vec![record]).await?;
        counter!("binlog_ddl", "keyrange" => self.keyrange_tag.clone()).increment(1);
        Ok(())
    }

    async fn handle_commit_event(
        &mut self,
        mut commit: EventLine,
        sender: &mpsc::Sender<BinlogRecord>,
    ) -> OxherdResult<()> {
        if !self.db_match {
            return Ok(());
        }

        if self.config.using_relay_logs {
            self.wait_for_replication_catchup().await?;
        }

        commit.position.xid = self.current_position.xid;
        self.txn_buffer.push(commit);

        let (records, dml_count) = self.build_txn_response()?;
        // Nothing in the subscriber's range: suppress the empty batch.
        if dml_count == 0 {
            return Ok(());
        }
        send_records(sender, records).await?;

        self.dml_count.fetch_add(dml_count, Ordering::Relaxed);
        self.txn_count.fetch_add(1, Ordering::Relaxed);
        counter!("binlog_dml", "keyrange" => self.keyrange_tag.clone()).increment(dml_count);
        counter!("binlog_txn", "keyrange" => self.keyrange_tag.clone()).increment(1);

        let sleep_ms = self.sleep_to_throttle_ms.load(Ordering::Relaxed);
        if sleep_ms > 0 {
            info!(keyrange = %self.keyrange_tag, sleep_ms, "throttling subscriber");
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        Ok(())
    }

    /// In relay mode, hold delivery until the local replica has actually
    /// applied up to the current position.
    async fn wait_for_replication_catchup(&self) -> OxherdResult<()> {
        let Some(monitor) = &self.apply_monitor else {
            return Ok(());
        };
        loop {
            let applied = monitor.applied_position().await?;
            let current = &self.current_position.coordinates;
            let caught_up = match compare_log_filenames(
                &applied.master_filename,
                &current.master_filename,
            ) {
                Some(std::cmp::Ordering::Equal) => {
                    current.master_offset <= applied.master_offset
                }
                Some(order) => order.is_gt(),
                None => {
                    return Err(OxherdError::Parse(format!(
                        "cannot compare applied position {} with {}",
                        applied.master_filename, current.master_filename
                    )))
                }
            };
            if caught_up {
                return Ok(());
            }
            monitor
                .wait_applied(current, Duration::from_secs(30))
                .await?;
        }
    }

    /// Turn the buffered transaction into subscriber records, filtering
    /// DMLs by key range.
    fn build_txn_response(&mut self) -> OxherdResult<(Vec<BinlogRecord>, u64)> {
        let mut records = Vec::new();
        let mut dml_count = 0u64;
        let mut autoinc_id: u64 = 0;
        let mut dml_prefix: Vec<String> = Vec::new();

        for event in &self.txn_buffer {
            match classify_keyword(&event.first_keyword) {
                SqlKind::Begin => {
                    records.push(BinlogRecord::at(StreamEventKind::Begin, &event.position)?);
                    continue;
                }
                SqlKind::Commit => {
                    records.push(BinlogRecord::at(StreamEventKind::Commit, &event.position)?);
                    continue;
                }
                _ => {}
            }
            if let Some(rest) = event.text.strip_prefix(SET_INSERT_ID) {
                autoinc_id = rest.trim().parse::<u64>().map_err(|e| {
                    OxherdError::Parse(format!("cannot extract insert id from {:?}: {e}", event.text))
                })?;
                continue;
            }

            let Some(kind) =
                StreamEventKind::from_dml_keyword(&event.first_keyword)
            else {
                // Prefix statements (SET TIMESTAMP and friends) travel with
                // the next DML.
                dml_prefix.push(event.text.clone());
                continue;
            };

            let Some(keyspace_id) = self.extract_keyspace_id(&event.text)? else {
                // A control-table statement; drop it and its prefixes.
                dml_prefix.clear();
                continue;
            };
            if !self.config.key_range.contains(&keyspace_id) {
                dml_prefix.clear();
                continue;
            }

            dml_count += 1;
            let mut record = BinlogRecord::at(kind, &event.position)?;
            record.keyspace_id = Some(keyspace_id.hex());
            dml_prefix.push(event.text.clone());
            record.sql = std::mem::take(&mut dml_prefix);

            match event.text.find(STREAM_COMMENT_START) {
                Some(idx) => {
                    let body = &event.text[idx + STREAM_COMMENT_START.len()..];
                    let body = body.split("*/").next().unwrap_or(body);
                    let comment = parse_stream_comment(body)?;
                    record.table = Some(comment.table.clone());
                    record.pk_col_names = comment.pk_col_names.clone();
                    record.pk_values = resolve_pk_values(&comment.pk_tuples, autoinc_id)?;
                }
                None => {
                    warn!(statement = %event.text, "DML without a stream comment");
                }
            }
            autoinc_id = 0;
            records.push(record);
        }

        Ok((records, dml_count))
    }

    /// Pull the keyspace id out of the `EMD` marker. Returns `None` for
    /// known control-table statements; anything else without a marker is a
    /// parse error.
    fn extract_keyspace_id(&self, sql: &str) -> OxherdResult<Option<KeyspaceId>> {
        let Some(idx) = sql.find(KEYSPACE_ID_COMMENT) else {
            if is_control_db_statement(sql) {
                warn!(statement = %sql, "ignoring control statement without keyspace id");
                return Ok(None);
            }
            return Err(OxherdError::Parse(format!(
                "statement without keyspace id: {sql:?}"
            )));
        };
        let rest = &sql[idx + KEYSPACE_ID_COMMENT.len()..];
        let id_text = rest
            .split(USER_ID)
            .next()
            .unwrap_or_default()
            .trim()
            .trim_end_matches("*/")
            .trim();
        let id = id_text.parse::<u64>().map_err(|e| {
            OxherdError::Parse(format!("bad keyspace id in {sql:?}: {e}"))
        })?;
        Ok(Some(KeyspaceId::from_u64(id)))
    }
}

fn is_control_db_statement(sql: &str) -> bool {
    let lowered = sql.to_ascii_lowercase();
    lowered.contains("_vt.") || (lowered.contains("admin") && lowered.contains("heartbeat"))
}

async fn send_records(
    sender: &mpsc::Sender<BinlogRecord>,
    records: Vec<BinlogRecord>,
) -> OxherdResult<()> {
    for record in records {
        sender.send(record).await.map_err(|_| {
            OxherdError::Parse("subscriber went away, closing stream".to_owned())
        })?;
    }
    Ok(())
}

/// Deliver a terminal error record carrying the position the stream died
/// at. Used by the server at the stream boundary.
pub async fn send_stream_error(
    sender: &mpsc::Sender<BinlogRecord>,
    error: &OxherdError,
    position: &BinlogPosition,
) {
    let mut record = match BinlogRecord::at(StreamEventKind::Error, position) {
        Ok(record) => record,
        Err(_) => BinlogRecord::default(),
    };
    record.sql_type = Some(StreamEventKind::Error);
    record.error = Some(error.to_string());
    let _ = sender.send(record).await;
}

#[cfg(test)]
mod tests {
    use replication_position::decode_position;

    use super::*;
    use crate::events::PkValue;

    fn parser_for(range: (&str, &str)) -> BinlogParser {
        BinlogParser::new(ParserConfig {
            dbname: "testdb".into(),
            key_range: KeyRange::from_hex(range.0, range.1).unwrap(),
            start_position: ReplicationCoordinates::new("vt-bin.000003", 0),
            using_relay_logs: false,
        })
    }

    async fn run(parser: &mut BinlogParser, input: &str) -> (Vec<BinlogRecord>, OxherdResult<()>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = parser.parse_binlog_stream(input.as_bytes(), &tx).await;
        drop(tx);
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        (records, result)
    }

    // A transaction with two DMLs whose keyspace ids are 0x40… and 0xa0….
    const TWO_DML_TXN: &str = "\
# at 4
#700101  1:00:00 server id 1  end_log_pos 120 \tQuery
use testdb/*!*/;
SET TIMESTAMP=1700000000/*!*/;
BEGIN/*!*/;
# at 120
#700101  1:00:00 server id 1  end_log_pos 250 \tQuery
insert into moves(a) values(1) /* EMD keyspace_id:4611686018427387904 user_id 3 */ /* _stream moves (id ) (1 ); */
/*!*/;
# at 250
#700101  1:00:00 server id 1  end_log_pos 341 \tQuery
insert into moves(a) values(2) /* EMD keyspace_id:11529215046068469760 user_id 9 */ /* _stream moves (id ) (2 ); */
/*!*/;
# at 341
#700101  1:00:00 server id 1  end_log_pos 400 \tXid = 5
COMMIT/*!*/;
";

    #[tokio::test]
    async fn transactions_filter_dmls_by_key_range() {
        let mut parser = parser_for(("80", "c0"));
        let (records, result) = run(&mut parser, TWO_DML_TXN).await;
        result.unwrap();

        let kinds: Vec<_> = records.iter().map(|r| r.sql_type.unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Begin,
                StreamEventKind::Insert,
                StreamEventKind::Commit
            ]
        );
        let dml = &records[1];
        assert_eq!(dml.keyspace_id.as_deref(), Some("a000000000000000"));
        assert_eq!(dml.table.as_deref(), Some("moves"));
        assert_eq!(dml.pk_col_names, vec!["id"]);
        assert_eq!(dml.pk_values, vec![vec![PkValue::Int(2)]]);
        assert_eq!(records[2].xid, 5);
        assert_eq!(records[2].timestamp, 1700000000);
    }

    #[tokio::test]
    async fn fully_filtered_transactions_are_suppressed() {
        // Nothing in [00, 10) matches either DML.
        let mut parser = parser_for(("00", "10"));
        let (records, result) = run(&mut parser, TWO_DML_TXN).await;
        result.unwrap();
        assert!(records.is_empty(), "got {records:?}");
    }

    #[tokio::test]
    async fn positions_are_monotonic_and_commit_stamped() {
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, TWO_DML_TXN).await;
        result.unwrap();

        let mut previous: Option<ReplicationCoordinates> = None;
        for record in &records {
            let coords = decode_position(&record.binlog_position).unwrap();
            if let Some(previous) = &previous {
                assert!(
                    previous.partial_cmp(&coords).map(|o| o.is_le()).unwrap_or(false),
                    "position went backwards: {previous} then {coords}"
                );
            }
            previous = Some(coords);
        }
        // The commit coordinate is the last statement's end position.
        let commit = decode_position(&records.last().unwrap().binlog_position).unwrap();
        assert_eq!(commit.master_offset, 400);
    }

    #[tokio::test]
    async fn rollback_discards_the_whole_transaction() {
        let input = "\
use testdb/*!*/;
SET TIMESTAMP=1700000000/*!*/;
BEGIN/*!*/;
insert into moves(a) values(1) /* EMD keyspace_id:42 user_id 1 */ /* _stream moves (id ) (1 ); */
/*!*/;
ROLLBACK/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, input).await;
        result.unwrap();
        assert!(records.is_empty(), "rolled-back txn leaked: {records:?}");
    }

    #[tokio::test]
    async fn ddl_is_emitted_as_a_single_record() {
        let input = "\
use testdb/*!*/;
SET TIMESTAMP=1700000000/*!*/;
create table moves (id bigint primary key)
/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, input).await;
        result.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sql_type, Some(StreamEventKind::Ddl));
        assert_eq!(records[0].sql, vec!["create table moves (id bigint primary key)"]);
    }

    #[tokio::test]
    async fn begin_inside_a_transaction_is_a_parse_error() {
        let input = "\
use testdb/*!*/;
BEGIN/*!*/;
BEGIN/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (_, result) = run(&mut parser, input).await;
        assert!(matches!(result, Err(OxherdError::Parse(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn dml_outside_a_transaction_is_a_parse_error() {
        let input = "\
use testdb/*!*/;
insert into moves(a) values(1) /* EMD keyspace_id:42 user_id 1 */
/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (_, result) = run(&mut parser, input).await;
        assert!(matches!(result, Err(OxherdError::Parse(_))));
    }

    #[tokio::test]
    async fn dml_without_keyspace_id_is_a_parse_error() {
        let input = "\
use testdb/*!*/;
BEGIN/*!*/;
insert into moves(a) values(1)
/*!*/;
#700101  1:00:00 server id 1  end_log_pos 400 \tXid = 5
COMMIT/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (_, result) = run(&mut parser, input).await;
        assert!(matches!(result, Err(OxherdError::Parse(_))));
    }

    #[tokio::test]
    async fn control_table_statements_are_skipped() {
        let input = "\
use testdb/*!*/;
BEGIN/*!*/;
insert into _vt.replication_log(time_created_ns) values (1)
/*!*/;
insert into moves(a) values(2) /* EMD keyspace_id:42 user_id 1 */ /* _stream moves (id ) (2 ); */
/*!*/;
#700101  1:00:00 server id 1  end_log_pos 400 \tXid = 5
COMMIT/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, input).await;
        result.unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r.sql_type.unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Begin,
                StreamEventKind::Insert,
                StreamEventKind::Commit
            ]
        );
    }

    #[tokio::test]
    async fn statements_for_other_databases_are_skipped() {
        let input = "\
use otherdb/*!*/;
SET TIMESTAMP=1700000000/*!*/;
BEGIN/*!*/;
insert into moves(a) values(1) /* EMD keyspace_id:42 user_id 1 */ /* _stream moves (id ) (1 ); */
/*!*/;
COMMIT/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, input).await;
        result.unwrap();
        assert!(records.is_empty(), "got {records:?}");
    }

    #[tokio::test]
    async fn set_insert_id_feeds_autoincrement_pks() {
        let input = "\
use testdb/*!*/;
BEGIN/*!*/;
SET INSERT_ID=77/*!*/;
insert into moves(a) values(null) /* EMD keyspace_id:42 user_id 1 */ /* _stream moves (id ) (null ); */
/*!*/;
#700101  1:00:00 server id 1  end_log_pos 400 \tXid = 5
COMMIT/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (records, result) = run(&mut parser, input).await;
        result.unwrap();
        assert_eq!(records[1].pk_values, vec![vec![PkValue::Uint(77)]]);
    }

    #[tokio::test]
    async fn rotate_lines_move_the_current_file() {
        let input = "\
# at 4
# Rotate to vt-bin.000008  pos: 4
use testdb/*!*/;
SET TIMESTAMP=1700000000/*!*/;
BEGIN/*!*/;
#700101  1:00:00 server id 1  end_log_pos 99 \tXid = 9
COMMIT/*!*/;
";
        let mut parser = parser_for(("", ""));
        let (_, result) = run(&mut parser, input).await;
        result.unwrap();
        assert_eq!(
            parser.current_position().coordinates.master_filename,
            "vt-bin.000008"
        );
    }
}
