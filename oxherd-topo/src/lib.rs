//! Topology service abstraction.
//!
//! All global state (tablet records, shard records, action queues, locks,
//! the replication graph) lives in a hierarchical namespace with per-node
//! versioning, ephemeral nodes, and watches. [`TopoConn`] is the only way
//! the rest of the system observes or changes that state.
//!
//! [`MemoryTopo`] is the in-process reference implementation; bindings to a
//! real coordination service implement the same trait.

pub mod conn;
pub mod memory;
pub mod paths;

pub use conn::{
    wait_for_node, CreateMode, NodeStat, NodeVersion, NodeWatch, TopoConn, TopoConnExt,
};
pub use memory::{ensure_path, MemoryConn, MemoryTopo};
