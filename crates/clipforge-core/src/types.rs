//! ClipForge Core Type Definitions
//!
//! Defines fundamental types used throughout the engine.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Numeric id of a project media item ("bin clip")
pub type ClipId = i64;

/// Numeric id of a bin folder
pub type FolderId = i64;

/// Numeric id of a legacy scheduler batch
pub type BatchId = i32;

/// Unique id of a task instance (ULID)
pub type TaskUid = String;

/// Sentinel meaning "no parent batch"
pub const NO_PARENT_BATCH: BatchId = -1;

/// Sentinel folder id meaning "project root"
pub const ROOT_FOLDER: FolderId = -1;

// =============================================================================
// Time Types
// =============================================================================

/// Time in seconds (floating point)
pub type TimeSec = f64;

/// Time in frames (integer)
pub type Frame = i64;

/// Sentinel frame meaning "use the clip's stored default frame"
pub const DEFAULT_FRAME: Frame = -1;

// =============================================================================
// Task Ownership
// =============================================================================

/// Identifies the resource a task operates on.
///
/// A task may target a whole clip or a sub-range of one (e.g. cutting a
/// zone out of a longer clip). Owner identity is fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOwner {
    /// The owning clip id
    pub item_id: ClipId,
    /// Optional in point (frames) when the task targets a zone
    pub zone_in: Option<Frame>,
    /// Optional out point (frames) when the task targets a zone
    pub zone_out: Option<Frame>,
}

impl TaskOwner {
    /// Owner covering a whole clip
    pub fn clip(item_id: ClipId) -> Self {
        Self {
            item_id,
            zone_in: None,
            zone_out: None,
        }
    }

    /// Owner covering a zone of a clip
    pub fn zone(item_id: ClipId, zone_in: Frame, zone_out: Frame) -> Self {
        Self {
            item_id,
            zone_in: Some(zone_in),
            zone_out: Some(zone_out),
        }
    }
}

// =============================================================================
// Task Kinds
// =============================================================================

/// Kind of background work a task performs.
///
/// The kind is fixed at construction and determines the scheduling
/// priority and which worker pool the task runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Proxy,
    Cut,
    Stabilize,
    Transcode,
    Filter,
    Thumbnail,
    Analyse,
    Load,
    AudioThumb,
    Speed,
    Cache,
    Custom,
    None,
}

impl TaskKind {
    /// Scheduling priority for this kind; higher runs first when a pool
    /// slot frees up.
    pub fn priority(self) -> i32 {
        match self {
            TaskKind::Load => 50,
            TaskKind::Thumbnail => 40,
            TaskKind::AudioThumb => 35,
            TaskKind::Cache => 30,
            TaskKind::Analyse => 20,
            TaskKind::Filter => 20,
            TaskKind::Cut => 15,
            TaskKind::Speed => 15,
            TaskKind::Custom => 15,
            TaskKind::Stabilize => 10,
            TaskKind::Proxy => 5,
            TaskKind::Transcode => 5,
            TaskKind::None => 0,
        }
    }

    /// Heavy kinds contend for hardware encoders and run on the
    /// constrained encode pool.
    pub fn is_heavy(self) -> bool {
        matches!(self, TaskKind::Proxy | TaskKind::Transcode)
    }
}

/// Matcher used by registry queries: a specific kind or any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindFilter {
    Any,
    Only(TaskKind),
}

impl KindFilter {
    pub fn matches(self, kind: TaskKind) -> bool {
        match self {
            KindFilter::Any => true,
            KindFilter::Only(k) => k == kind,
        }
    }
}

// =============================================================================
// Task Status
// =============================================================================

/// Lifecycle state of a task.
///
/// `Succeeded`, `Failed` and `Canceled` are terminal; there is no retry
/// transition. A failed task must be resubmitted as a new instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_priorities_order_load_first() {
        assert!(TaskKind::Load.priority() > TaskKind::Stabilize.priority());
        assert!(TaskKind::Thumbnail.priority() > TaskKind::Proxy.priority());
    }

    #[test]
    fn test_heavy_kinds() {
        assert!(TaskKind::Proxy.is_heavy());
        assert!(TaskKind::Transcode.is_heavy());
        assert!(!TaskKind::Thumbnail.is_heavy());
        assert!(!TaskKind::Speed.is_heavy());
    }

    #[test]
    fn test_kind_filter() {
        assert!(KindFilter::Any.matches(TaskKind::Cut));
        assert!(KindFilter::Only(TaskKind::Cut).matches(TaskKind::Cut));
        assert!(!KindFilter::Only(TaskKind::Cut).matches(TaskKind::Speed));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_owner_zone() {
        let owner = TaskOwner::zone(7, 25, 100);
        assert_eq!(owner.item_id, 7);
        assert_eq!(owner.zone_in, Some(25));
        assert_ne!(owner, TaskOwner::clip(7));
    }
}
