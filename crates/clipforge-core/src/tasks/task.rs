//! Task unit: one cancellable background operation.
//!
//! Owner and kind are immutable after construction. Progress only ever
//! moves forward. The lifecycle is Created → Queued → Running →
//! {Succeeded, Failed, Canceled}; terminal states are final and a
//! failed task must be resubmitted as a fresh instance.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::events::{EngineEvent, EventSink, ProgressThrottle};
use crate::pipeline::CancelToken;
use crate::undo::{SharedUndoStack, StateOp};
use crate::{TaskKind, TaskOwner, TaskResult, TaskStatus, TaskUid};

use super::TaskContext;

/// Staged commit closures produced by a successful run
pub struct StagedCommit {
    /// Applies the result to shared project state
    pub operation: StateOp,
    /// Restores the prior state
    pub reverse: StateOp,
}

/// Shared mutable state of one task instance
pub struct TaskState {
    uid: TaskUid,
    owner: TaskOwner,
    kind: TaskKind,
    description: String,
    status: Mutex<TaskStatus>,
    progress: AtomicI32,
    cancel: CancelToken,
    soft_delete: AtomicBool,
    force: AtomicBool,
    running: AtomicBool,
    successful: AtomicBool,
    error_message: Mutex<String>,
    log_details: Mutex<String>,
    throttle: ProgressThrottle,
    staged: Mutex<Option<StagedCommit>>,
    result_consumed: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TaskState {
    pub fn new(owner: TaskOwner, kind: TaskKind, description: impl Into<String>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            uid: ulid::Ulid::new().to_string(),
            owner,
            kind,
            description: description.into(),
            status: Mutex::new(TaskStatus::Created),
            progress: AtomicI32::new(0),
            cancel: CancelToken::new(),
            soft_delete: AtomicBool::new(false),
            force: AtomicBool::new(false),
            running: AtomicBool::new(false),
            successful: AtomicBool::new(false),
            error_message: Mutex::new(String::new()),
            log_details: Mutex::new(String::new()),
            throttle: ProgressThrottle::default(),
            staged: Mutex::new(None),
            result_consumed: AtomicBool::new(false),
            done_tx,
            done_rx,
        }
    }

    pub fn uid(&self) -> &TaskUid {
        &self.uid
    }

    pub fn owner(&self) -> TaskOwner {
        self.owner
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.kind.priority()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Not yet in a terminal state
    pub fn is_pending(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_successful(&self) -> bool {
        self.successful.load(Ordering::SeqCst)
    }

    pub(crate) fn set_successful(&self, ok: bool) {
        self.successful.store(ok, Ordering::SeqCst);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Requests cancellation. Each direction latches exactly once; a
    /// second call is a no-op. Safe to call concurrently with the run.
    ///
    /// With `soft_delete` the owning clip is being torn down and the
    /// task must not touch it while unwinding.
    pub fn cancel(&self, soft_delete: bool) {
        if soft_delete {
            self.soft_delete.store(true, Ordering::SeqCst);
        }
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn is_soft_delete(&self) -> bool {
        self.soft_delete.load(Ordering::SeqCst)
    }

    /// Token handed to pipelines so they can kill spawned processes
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Re-run even when cached output exists
    pub fn set_force(&self, force: bool) {
        self.force.store(force, Ordering::SeqCst);
    }

    pub fn is_force(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Progress
    // =========================================================================

    pub fn progress(&self) -> i32 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Records a new progress value and pushes a throttled update.
    ///
    /// Values never regress: a report below the current value is
    /// dropped. Nothing is emitted after cancellation.
    pub fn report_progress(&self, progress: i32, events: &EventSink) {
        let progress = progress.clamp(0, 100);
        let previous = self.progress.fetch_max(progress, Ordering::SeqCst);
        if progress <= previous || self.is_canceled() {
            return;
        }
        if self.throttle.admit(progress) {
            events.emit(EngineEvent::TaskProgress {
                item_id: self.owner.item_id,
                uid: self.uid.clone(),
                progress,
            });
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn error_message(&self) -> String {
        self.error_message.lock().unwrap().clone()
    }

    pub fn append_error(&self, message: &str) {
        let mut error = self.error_message.lock().unwrap();
        if !error.is_empty() {
            error.push('\n');
        }
        error.push_str(message);
    }

    pub fn log_details(&self) -> String {
        self.log_details.lock().unwrap().clone()
    }

    pub fn append_log(&self, details: &str) {
        self.log_details.lock().unwrap().push_str(details);
    }

    // =========================================================================
    // Completion signal
    // =========================================================================

    /// Marks the worker as fully unwound. Called by the scheduler after
    /// the run returned and registry bookkeeping finished, never by the
    /// task body.
    pub(crate) fn signal_done(&self) {
        let _ = self.done_tx.send(true);
    }

    /// Resolves once the worker thread has observed completion or
    /// cancellation and unwound. After this returns, no worker holds a
    /// reference into the owning clip's data.
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // =========================================================================
    // Commit protocol
    // =========================================================================

    /// Stages the operation/reverse pair produced by a successful run.
    pub fn stage_commit(&self, operation: StateOp, reverse: StateOp) {
        *self.staged.lock().unwrap() = Some(StagedCommit { operation, reverse });
    }

    /// Consumes the task's result exactly once.
    ///
    /// Returns false when the task did not reach `Succeeded` (the caller
    /// must not trust any output) or when applying the staged operation
    /// failed. On success the pair is registered with the undo sink
    /// under the task's description. Never re-runs the background
    /// computation; a second call panics.
    pub fn commit_result(&self, undo_stack: &SharedUndoStack) -> bool {
        let already = self.result_consumed.swap(true, Ordering::SeqCst);
        assert!(
            !already,
            "commit_result called twice for task {}",
            self.uid
        );
        if !self.is_successful() {
            return false;
        }
        let staged = self.staged.lock().unwrap().take();
        match staged {
            None => true,
            Some(StagedCommit { operation, reverse }) => {
                if !(operation)() {
                    return false;
                }
                undo_stack
                    .lock()
                    .unwrap()
                    .push(operation, reverse, self.description.clone());
                true
            }
        }
    }
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("uid", &self.uid)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

/// One schedulable unit of background work.
///
/// Implementations hold a [`TaskState`] and put all work in `execute`;
/// queueing, status transitions, error reporting and the mandatory
/// registry notification are handled by the task manager around the
/// call.
#[async_trait]
pub trait ClipTask: Send + Sync {
    fn state(&self) -> &TaskState;

    /// The task body, executed on a pool worker. Cancellation must be
    /// polled between work increments; partial outputs must be removed
    /// on the way out.
    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()>;
}
