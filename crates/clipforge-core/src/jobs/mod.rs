//! Legacy Batch Job Scheduler
//!
//! The older scheduling path, kept as a compatibility layer: a
//! conceptual operation fans out over several clips as one batch, with
//! optional parent/child ordering between batches and exactly one undo
//! push per batch. New code should prefer the task system in
//! [`crate::tasks`]; this module exists for callers still built around
//! batch semantics.

mod filterjob;
mod job;
mod scheduler;

pub use filterjob::*;
pub use job::*;
pub use scheduler::*;
