//! Scripted fakes for hermetic agent and coordinator tests.
//!
//! [`FakeMysqlDriver`] records every call and serves canned replies;
//! individual methods can be told to fail or panic to exercise the error
//! paths. [`FakeManifestFetcher`] serves manifests from an in-memory map.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use oxherd_common::KeyRange;
use oxherd_errors::{OxherdError, OxherdResult};
use parking_lot::Mutex;
use replication_position::{ReplicationPosition, ReplicationState};

use crate::manifest::{
    ManifestFetcher, SchemaChange, SchemaChangeResult, SchemaDefinition, SnapshotManifest,
    SplitSnapshotManifest,
};
use crate::mysql::{MysqlDriver, PromotionData};

#[derive(Default)]
struct FakeState {
    master_position: ReplicationPosition,
    slave_position: ReplicationPosition,
    promotion: PromotionData,
    is_master: bool,
    master_addr: String,
    slave_addrs: Vec<String>,
    schema: SchemaDefinition,
    snapshot_manifest_path: String,
    fail: HashSet<String>,
    panic_on: HashSet<String>,
}

/// A scripted MySQL control interface.
#[derive(Default)]
pub struct FakeMysqlDriver {
    calls: Mutex<Vec<String>>,
    state: Mutex<FakeState>,
}

impl FakeMysqlDriver {
    pub fn new() -> Self {
        FakeMysqlDriver::default()
    }

    /// Every driver call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn set_master_position(&self, position: ReplicationPosition) {
        self.state.lock().master_position = position;
    }

    pub fn set_slave_position(&self, position: ReplicationPosition) {
        self.state.lock().slave_position = position;
    }

    pub fn set_promotion(&self, promotion: PromotionData) {
        self.state.lock().promotion = promotion;
    }

    pub fn set_is_master(&self, is_master: bool) {
        self.state.lock().is_master = is_master;
    }

    pub fn set_master_addr(&self, addr: impl Into<String>) {
        self.state.lock().master_addr = addr.into();
    }

    pub fn set_slave_addrs(&self, addrs: Vec<String>) {
        self.state.lock().slave_addrs = addrs;
    }

    pub fn set_schema(&self, schema: SchemaDefinition) {
        self.state.lock().schema = schema;
    }

    pub fn set_snapshot_manifest_path(&self, path: impl Into<String>) {
        self.state.lock().snapshot_manifest_path = path.into();
    }

    /// Make `method` return a `Fatal` error.
    pub fn fail_on(&self, method: &str) {
        self.state.lock().fail.insert(method.to_owned());
    }

    /// Make `method` panic, to exercise dispatch panic capture.
    pub fn panic_on(&self, method: &str) {
        self.state.lock().panic_on.insert(method.to_owned());
    }

    fn enter(&self, method: &str) -> OxherdResult<()> {
        self.calls.lock().push(method.to_owned());
        let state = self.state.lock();
        if state.panic_on.contains(method) {
            panic!("scripted panic in {method}");
        }
        if state.fail.contains(method) {
            return Err(OxherdError::Fatal(format!("scripted failure in {method}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MysqlDriver for FakeMysqlDriver {
    async fn set_read_only(&self, read_only: bool) -> OxherdResult<()> {
        self.enter(if read_only {
            "set_read_only"
        } else {
            "set_read_write"
        })
    }

    async fn demote_master(&self) -> OxherdResult<ReplicationPosition> {
        self.enter("demote_master")?;
        Ok(self.state.lock().master_position.clone())
    }

    async fn promote_slave(&self) -> OxherdResult<PromotionData> {
        self.enter("promote_slave")?;
        Ok(self.state.lock().promotion.clone())
    }

    async fn reparent_position(
        &self,
        _slave_position: &ReplicationPosition,
    ) -> OxherdResult<PromotionData> {
        self.enter("reparent_position")?;
        Ok(self.state.lock().promotion.clone())
    }

    async fn restart_slave(
        &self,
        _data: &ReplicationState,
        _wait_position: &ReplicationPosition,
        _time_promoted: i64,
    ) -> OxherdResult<()> {
        self.enter("restart_slave")
    }

    async fn stop_slave(&self) -> OxherdResult<()> {
        self.enter("stop_slave")
    }

    async fn break_slaves(&self) -> OxherdResult<()> {
        self.enter("break_slaves")
    }

    async fn master_status(&self) -> OxherdResult<ReplicationPosition> {
        self.enter("master_status")?;
        Ok(self.state.lock().master_position.clone())
    }

    async fn slave_status(&self) -> OxherdResult<ReplicationPosition> {
        self.enter("slave_status")?;
        Ok(self.state.lock().slave_position.clone())
    }

    async fn wait_master_pos(
        &self,
        _position: &ReplicationPosition,
        _timeout: Duration,
    ) -> OxherdResult<()> {
        self.enter("wait_master_pos")
    }

    async fn is_master(&self) -> OxherdResult<bool> {
        self.enter("is_master")?;
        Ok(self.state.lock().is_master)
    }

    async fn master_addr(&self) -> OxherdResult<String> {
        self.enter("master_addr")?;
        Ok(self.state.lock().master_addr.clone())
    }

    async fn get_slaves(&self) -> OxherdResult<Vec<String>> {
        self.enter("get_slaves")?;
        Ok(self.state.lock().slave_addrs.clone())
    }

    async fn get_schema(&self, _db_name: &str) -> OxherdResult<SchemaDefinition> {
        self.enter("get_schema")?;
        Ok(self.state.lock().schema.clone())
    }

    async fn preflight_schema_change(
        &self,
        _db_name: &str,
        _change: &str,
    ) -> OxherdResult<SchemaChangeResult> {
        self.enter("preflight_schema_change")?;
        let schema = self.state.lock().schema.clone();
        Ok(SchemaChangeResult {
            before_schema: schema.clone(),
            after_schema: schema,
        })
    }

    async fn apply_schema_change(
        &self,
        _db_name: &str,
        _change: &SchemaChange,
    ) -> OxherdResult<SchemaChangeResult> {
        self.enter("apply_schema_change")?;
        let schema = self.state.lock().schema.clone();
        Ok(SchemaChangeResult {
            before_schema: schema.clone(),
            after_schema: schema,
        })
    }

    async fn create_snapshot(
        &self,
        _db_name: &str,
        _addr: &str,
        _concurrency: usize,
    ) -> OxherdResult<String> {
        self.enter("create_snapshot")?;
        Ok(self.state.lock().snapshot_manifest_path.clone())
    }

    async fn create_split_snapshot(
        &self,
        _db_name: &str,
        _key_name: &str,
        _key_range: &KeyRange,
        _addr: &str,
        _concurrency: usize,
    ) -> OxherdResult<String> {
        self.enter("create_split_snapshot")?;
        Ok(self.state.lock().snapshot_manifest_path.clone())
    }

    async fn snapshot_source_end(
        &self,
        _slave_start_required: bool,
        _read_only: bool,
    ) -> OxherdResult<()> {
        self.enter("snapshot_source_end")
    }

    async fn restore_from_snapshot(&self, _manifest: &SnapshotManifest) -> OxherdResult<()> {
        self.enter("restore_from_snapshot")
    }

    async fn restore_from_partial_snapshot(
        &self,
        _manifest: &SplitSnapshotManifest,
    ) -> OxherdResult<()> {
        self.enter("restore_from_partial_snapshot")
    }
}

/// Serves manifests from memory, keyed by `(addr, file_path)`.
#[derive(Default)]
pub struct FakeManifestFetcher {
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FakeManifestFetcher {
    pub fn new() -> Self {
        FakeManifestFetcher::default()
    }

    pub fn insert_json<T: serde::Serialize>(&self, addr: &str, file_path: &str, value: &T) {
        let bytes = serde_json::to_vec(value).expect("fixture serializes");
        self.files
            .lock()
            .insert((addr.to_owned(), file_path.to_owned()), bytes);
    }
}

#[async_trait]
impl ManifestFetcher for FakeManifestFetcher {
    async fn fetch(&self, addr: &str, file_path: &str) -> OxherdResult<Vec<u8>> {
        self.files
            .lock()
            .get(&(addr.to_owned(), file_path.to_owned()))
            .cloned()
            .ok_or_else(|| {
                OxherdError::NodeNotFound(format!("no fixture for {addr}{file_path}"))
            })
    }
}
