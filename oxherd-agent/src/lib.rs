//! The per-tablet agent.
//!
//! Coordinators queue [`actionnode::ActionNode`]s under a tablet's action
//! path; the tablet's [`actor::TabletActor`] claims each node with a
//! compare-and-swap, dispatches it against the local MySQL (through
//! [`mysql::MysqlDriver`]) and the topology service, records the terminal
//! outcome on the action log, and deletes the queue node.

pub mod actionnode;
pub mod actor;
pub mod hook;
pub mod initiator;
pub mod manifest;
pub mod mysql;
pub mod records;
pub mod testing;

pub use actionnode::{ActionArgs, ActionKind, ActionNode, ActionReply, ActionState};
pub use actor::{Agent, TabletActor};
pub use hook::{Hook, HookResult};
pub use initiator::ActionInitiator;
pub use manifest::{ManifestFetcher, SnapshotFile, SnapshotManifest, SplitSnapshotManifest};
pub use mysql::MysqlDriver;
pub use records::TabletInfo;
