//! The MySQL control interface.
//!
//! Process lifecycle and replication primitives live outside this
//! repository; agents reach them through [`MysqlDriver`]. Every method is a
//! suspension point and may take seconds (a demote flushes tables, a
//! restore copies gigabytes).

use std::time::Duration;

use async_trait::async_trait;
use oxherd_errors::OxherdResult;
use replication_position::{ReplicationPosition, ReplicationState};

use crate::manifest::{
    SchemaChange, SchemaChangeResult, SchemaDefinition, SnapshotManifest, SplitSnapshotManifest,
};

/// What `promote_slave` / `reparent_position` hand back: the state slaves
/// need to reattach, the position they must reach first, and the promotion
/// timestamp used to verify replication.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromotionData {
    pub replication_state: ReplicationState,
    pub wait_position: ReplicationPosition,
    pub time_promoted: i64,
}

/// Control surface of the local MySQL instance.
#[async_trait]
pub trait MysqlDriver: Send + Sync {
    /// Toggle the global read-only flag.
    async fn set_read_only(&self, read_only: bool) -> OxherdResult<()>;

    /// Make the master read-only and report its final binlog position.
    async fn demote_master(&self) -> OxherdResult<ReplicationPosition>;

    /// Promote this (caught-up) slave to master.
    async fn promote_slave(&self) -> OxherdResult<PromotionData>;

    /// Compute restart data for slaves of a master that stopped at
    /// `slave_position`, without promoting anyone.
    async fn reparent_position(
        &self,
        slave_position: &ReplicationPosition,
    ) -> OxherdResult<PromotionData>;

    /// Reattach this slave per the promotion data.
    async fn restart_slave(&self, data: &ReplicationState, wait_position: &ReplicationPosition,
        time_promoted: i64) -> OxherdResult<()>;

    async fn stop_slave(&self) -> OxherdResult<()>;

    /// Force-break replication on all slaves of this master (used before
    /// restoring a snapshot over them).
    async fn break_slaves(&self) -> OxherdResult<()>;

    /// The master's own binlog position.
    async fn master_status(&self) -> OxherdResult<ReplicationPosition>;

    /// The slave's view of its replication progress.
    async fn slave_status(&self) -> OxherdResult<ReplicationPosition>;

    /// Block until the slave has applied at least `position`.
    async fn wait_master_pos(
        &self,
        position: &ReplicationPosition,
        timeout: Duration,
    ) -> OxherdResult<()>;

    /// True when this instance is serving as a master (not replicating).
    async fn is_master(&self) -> OxherdResult<bool>;

    /// `host:port` of the master this slave replicates from.
    async fn master_addr(&self) -> OxherdResult<String>;

    /// IP addresses of replicas currently connected to this master.
    async fn get_slaves(&self) -> OxherdResult<Vec<String>>;

    async fn get_schema(&self, db_name: &str) -> OxherdResult<SchemaDefinition>;

    async fn preflight_schema_change(
        &self,
        db_name: &str,
        change: &str,
    ) -> OxherdResult<SchemaChangeResult>;

    async fn apply_schema_change(
        &self,
        db_name: &str,
        change: &SchemaChange,
    ) -> OxherdResult<SchemaChangeResult>;

    /// Dump the whole database and return the manifest path, served from
    /// `addr`.
    async fn create_snapshot(
        &self,
        db_name: &str,
        addr: &str,
        concurrency: usize,
    ) -> OxherdResult<String>;

    /// Dump only rows in `key_range` of `key_name` and return the manifest
    /// path.
    async fn create_split_snapshot(
        &self,
        db_name: &str,
        key_name: &str,
        key_range: &oxherd_common::KeyRange,
        addr: &str,
        concurrency: usize,
    ) -> OxherdResult<String>;

    /// Resume normal service after acting as a snapshot source.
    async fn snapshot_source_end(
        &self,
        slave_start_required: bool,
        read_only: bool,
    ) -> OxherdResult<()>;

    async fn restore_from_snapshot(&self, manifest: &SnapshotManifest) -> OxherdResult<()>;

    async fn restore_from_partial_snapshot(
        &self,
        manifest: &SplitSnapshotManifest,
    ) -> OxherdResult<()>;
}
