//! ClipForge Core Engine
//!
//! Background job and task execution engine for project media clips.
//! Handles scheduling, running, cancelling and committing the results of
//! long-running media operations (thumbnails, audio levels, proxies,
//! transcodes, speed changes, stabilization, scene detection).

pub mod events;
pub mod jobs;
pub mod pipeline;
pub mod process;
pub mod project;
pub mod settings;
pub mod tasks;
pub mod undo;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
