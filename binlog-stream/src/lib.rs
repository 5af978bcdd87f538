//! Binlog streaming: tail a MySQL binary log, parse its text form into
//! transaction batches, filter by keyspace range, and serve the result to
//! subscribers with fair-share throttling.
//!
//! The pipeline per subscriber is `reader -> text decoder -> parser`,
//! connected by in-process pipes. The reader follows file rotations; the
//! parser groups statements into transactions and stamps every outgoing
//! record with its commit coordinate.

pub mod decoder;
pub mod events;
pub mod parser;
pub mod reader;
pub mod server;
pub mod stream_comment;

pub use events::{BinlogPosition, BinlogRecord, PkValue, StreamEventKind};
pub use parser::{ApplyMonitor, BinlogParser, ParserConfig};
pub use reader::BinlogReader;
pub use server::{BinlogServer, BinlogServerConfig, StreamRequest};
