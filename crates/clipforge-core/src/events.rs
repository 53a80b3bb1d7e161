//! Engine Event Channel
//!
//! Workers never touch UI or project-view state directly. Progress, job
//! counts and user-facing messages flow through a single event channel
//! consumed by one receiver (the application shell, or the test driving
//! the engine). Delivery order is preserved per task.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::tasks::ClipTask;
use crate::{ClipId, TaskUid};

/// Severity of a user-facing message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event emitted by the engine
#[derive(Clone)]
pub enum EngineEvent {
    /// Number of pending tasks changed
    TaskCount(usize),
    /// A task's progress advanced. Values for one task arrive in the
    /// order they were produced and never decrease; no ordering is
    /// guaranteed across tasks. Aggregate per-clip progress is queried
    /// from the task manager.
    TaskProgress {
        item_id: ClipId,
        uid: TaskUid,
        progress: i32,
    },
    /// A clip's data changed and views should refresh
    ClipUpdated { item_id: ClipId },
    /// A task reached a terminal state. The receiver owns the commit
    /// step: call `commit_result` on the task to apply staged results.
    TaskDone { task: Arc<dyn ClipTask> },
    /// User-facing message, optionally with captured process log
    Message {
        severity: Severity,
        text: String,
        log: Option<String>,
    },
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::TaskCount(n) => f.debug_tuple("TaskCount").field(n).finish(),
            EngineEvent::TaskProgress {
                item_id,
                uid,
                progress,
            } => f
                .debug_struct("TaskProgress")
                .field("item_id", item_id)
                .field("uid", uid)
                .field("progress", progress)
                .finish(),
            EngineEvent::ClipUpdated { item_id } => f
                .debug_struct("ClipUpdated")
                .field("item_id", item_id)
                .finish(),
            EngineEvent::TaskDone { task } => f
                .debug_struct("TaskDone")
                .field("uid", &task.state().uid())
                .finish(),
            EngineEvent::Message {
                severity,
                text,
                log,
            } => f
                .debug_struct("Message")
                .field("severity", severity)
                .field("text", text)
                .field("log", log)
                .finish(),
        }
    }
}

/// Sending half of the engine event channel.
///
/// Cloneable; send failures (receiver dropped) are ignored so a headless
/// engine keeps running without a consumer.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    /// Creates the event channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Creates a sink whose events go nowhere
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Emits an event
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Emits a warning message
    pub fn warn(&self, text: impl Into<String>, log: Option<String>) {
        self.emit(EngineEvent::Message {
            severity: Severity::Warning,
            text: text.into(),
            log,
        });
    }
}

/// Rate limiter for per-task progress updates.
///
/// Progress can change per decoded frame; pushing every change floods
/// the consumer. Intermediate values are limited to a few per second,
/// while terminal values (>= 100) always pass.
pub struct ProgressThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true if an update with this value should be delivered now
    pub fn admit(&self, progress: i32) -> bool {
        if progress >= 100 {
            return true;
        }
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        // At most four intermediate updates per second
        Self::new(Duration::from_millis(250))
    }
}
