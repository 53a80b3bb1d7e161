//! Legacy job unit and its commit accumulation.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::events::{EngineEvent, EventSink};
use crate::pipeline::CancelToken;
use crate::tasks::TaskContext;
use crate::undo::StateOp;
use crate::{ClipId, TaskUid};

/// Mutable state shared by every legacy job implementation.
pub struct JobState {
    uid: TaskUid,
    progress: AtomicI32,
    cancel: CancelToken,
    done: AtomicBool,
    successful: AtomicBool,
    result_consumed: AtomicBool,
    error_message: Mutex<String>,
    log_details: Mutex<String>,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            uid: ulid::Ulid::new().to_string(),
            progress: AtomicI32::new(0),
            cancel: CancelToken::new(),
            done: AtomicBool::new(false),
            successful: AtomicBool::new(false),
            result_consumed: AtomicBool::new(false),
            error_message: Mutex::new(String::new()),
            log_details: Mutex::new(String::new()),
        }
    }

    pub fn uid(&self) -> &TaskUid {
        &self.uid
    }

    pub fn progress(&self) -> i32 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Monotone progress update plus event push
    pub fn report_progress(&self, clip_id: ClipId, progress: i32, events: &EventSink) {
        let progress = progress.clamp(0, 100);
        let previous = self.progress.fetch_max(progress, Ordering::SeqCst);
        if progress <= previous || self.is_canceled() {
            return;
        }
        events.emit(EngineEvent::TaskProgress {
            item_id: clip_id,
            uid: self.uid.clone(),
            progress,
        });
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Marks the run finished
    pub fn finish(&self, successful: bool) {
        self.successful.store(successful, Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn is_successful(&self) -> bool {
        self.successful.load(Ordering::SeqCst)
    }

    /// Guards the exactly-once commit contract. Panics on a second
    /// call; returns whether the job's output may be trusted.
    pub fn begin_commit(&self) -> bool {
        let already = self.result_consumed.swap(true, Ordering::SeqCst);
        assert!(!already, "commit_result called twice for job {}", self.uid);
        self.is_done() && self.is_successful()
    }

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
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobState")
            .field("uid", &self.uid)
            .field("progress", &self.progress())
            .field("done", &self.is_done())
            .field("successful", &self.is_successful())
            .finish()
    }
}

/// Collects per-job operation/reverse closures into the batch's single
/// undo entry: operations replay in commit order, reverses in the
/// opposite order.
#[derive(Default)]
pub struct UndoAccumulator {
    operations: Vec<StateOp>,
    reverses: Vec<StateOp>,
}

impl UndoAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: StateOp, reverse: StateOp) {
        self.operations.push(operation);
        self.reverses.push(reverse);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Composes the collected closures into one pair. The operations
    /// have already run once by the time a batch registers the pair.
    pub fn into_pair(self) -> (StateOp, StateOp) {
        let operations = self.operations;
        let reverses = self.reverses;
        (
            Box::new(move || operations.iter().all(|op| op())),
            Box::new(move || reverses.iter().rev().all(|rev| rev())),
        )
    }
}

/// One legacy job instance: run on a pooled future, committed on the
/// batch's completion handler.
#[async_trait]
pub trait ClipJob: Send + Sync {
    fn job_state(&self) -> &JobState;

    /// Clip this job instance processes
    fn clip_id(&self) -> ClipId;

    /// Human-readable description (used for batch messages)
    fn description(&self) -> String;

    /// The job body. Returns overall success; implementations must call
    /// `job_state().finish(..)` before returning and poll the cancel
    /// token between work increments.
    async fn run(&self, ctx: &TaskContext) -> bool;

    /// Applies the job's result exactly once, extending the batch's
    /// undo accumulation. Returns false when the result cannot be
    /// trusted or applying failed; the batch then skips the undo push.
    fn commit_result(&self, accum: &mut UndoAccumulator) -> bool;
}
