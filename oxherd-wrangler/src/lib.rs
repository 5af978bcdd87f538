//! The wrangler drives fleet-wide operations: reparenting masters, changing
//! tablet roles, validating graph consistency, snapshotting, restoring.
//!
//! As with all distributed systems, things can skew. The wrangler composes
//! per-tablet actions (executed remotely by agents) with shard-wide locks
//! so that multi-tablet transitions have a single writer.

pub mod lock;
pub mod reparent;
pub mod reparent_external;
pub mod shards;
pub mod snapshot;
pub mod validator;
pub mod wrangler;

pub use lock::ShardLock;
pub use wrangler::{Wrangler, DEFAULT_ACTION_TIMEOUT};
