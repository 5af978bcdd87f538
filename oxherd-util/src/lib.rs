//! Concurrency and lifecycle utilities shared by the oxherd crates.

pub mod lifecycle;
pub mod recorder;
pub mod sema;

pub use lifecycle::{Lifecycle, WorkGuard};
pub use recorder::{AllErrorRecorder, ErrorRecorder, FirstErrorRecorder};
pub use sema::{MultiResourceConstraint, ResourceConstraint};
