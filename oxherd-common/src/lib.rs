//! Shared data model for the oxherd control plane.
//!
//! Everything here is plain data: hashed key ranges, tablet records, shard
//! records. These types are what gets serialized into the topology service,
//! so changes must stay wire-compatible.

pub mod key;
pub mod keyspace;
pub mod shard;
pub mod tablet;

pub use key::{KeyRange, KeyspaceId};
pub use keyspace::{Keyspace, KeyspaceShard};
pub use shard::{Shard, ShardInfo};
pub use tablet::{is_trivial_type_change, Tablet, TabletAlias, TabletState, TabletType};
