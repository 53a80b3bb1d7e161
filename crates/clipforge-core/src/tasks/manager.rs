//! Task Manager
//!
//! Tracks in-flight tasks per owning clip, dispatches them onto the
//! worker pools and provides the cancellation fan-out point. All
//! registry state sits behind one reader/writer lock; queries take the
//! read side, every mutation takes the write side. A clip id present in
//! the map always holds a non-empty task list — the entry is removed in
//! the same critical section that empties it, so no reader ever
//! observes a dangling empty entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::pool::WorkerPool;
use super::task::ClipTask;
use super::TaskContext;
use crate::events::EngineEvent;
use crate::{ClipId, KindFilter, TaskError, TaskStatus, TaskUid};

/// Schedules tasks and answers "what is running for clip R" without
/// scanning global state.
pub struct TaskManager {
    context: Arc<TaskContext>,
    tasks: RwLock<HashMap<ClipId, Vec<Arc<dyn ClipTask>>>>,
    /// Teardown mode: new submissions are discarded and per-task
    /// bookkeeping is deferred to the bulk-cancel path
    blocked: AtomicBool,
    general_pool: Arc<WorkerPool>,
    encode_pool: Arc<WorkerPool>,
}

impl TaskManager {
    /// Creates a manager with default pool sizes: general = available
    /// cores − 1 (min 1), encode = the configured encode concurrency.
    pub fn new(context: TaskContext) -> Arc<Self> {
        let general = num_cpus::get().saturating_sub(1).max(1);
        let encode = context
            .settings
            .read()
            .unwrap()
            .encoding
            .encode_concurrency;
        Self::with_workers(context, general, encode)
    }

    /// Creates a manager with explicit pool sizes
    pub fn with_workers(context: TaskContext, general: usize, encode: usize) -> Arc<Self> {
        let manager = Arc::new(Self {
            context: Arc::new(context),
            tasks: RwLock::new(HashMap::new()),
            blocked: AtomicBool::new(false),
            general_pool: WorkerPool::new("general", general),
            encode_pool: WorkerPool::new("encode", encode),
        });
        manager.general_pool.attach(&manager);
        manager.encode_pool.attach(&manager);
        manager
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Applies a new encode-pool concurrency; takes effect for
    /// subsequently submitted tasks.
    pub fn update_concurrency(&self, workers: usize) {
        self.context
            .settings
            .write()
            .unwrap()
            .encoding
            .encode_concurrency = workers;
        self.encode_pool.set_target(workers);
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Registers a task for its owner and submits it to the pool
    /// matching its kind. During teardown the task is discarded.
    pub fn start_task(self: &Arc<Self>, task: Arc<dyn ClipTask>) {
        let state = task.state();
        if self.is_blocked() {
            debug!("Discarding task {}: teardown in progress", state.uid());
            state.cancel(false);
            state.set_status(TaskStatus::Canceled);
            state.signal_done();
            return;
        }
        {
            let mut tasks = self.tasks.write().unwrap();
            tasks
                .entry(state.owner().item_id)
                .or_default()
                .push(Arc::clone(&task));
        }
        state.set_status(TaskStatus::Queued);
        let priority = state.priority();
        if state.kind().is_heavy() {
            self.encode_pool.submit(task, priority);
        } else {
            self.general_pool.submit(task, priority);
        }
        self.emit_task_count();
    }

    /// Executes one task body with the mandatory protocol around it:
    /// cancellation/teardown short-circuit, status transitions, error
    /// reporting per the taxonomy, and the unconditional registry
    /// notification plus done signal — even on early-return paths.
    pub(crate) async fn run_one(self: &Arc<Self>, task: Arc<dyn ClipTask>) {
        let state = task.state();
        let outcome = if state.is_canceled() || self.is_blocked() {
            Err(TaskError::Canceled)
        } else {
            state.set_status(TaskStatus::Running);
            state.set_running(true);
            task.execute(self.context.as_ref()).await
        };
        state.set_running(false);
        match outcome {
            Ok(()) => {
                state.set_successful(true);
                state.report_progress(100, &self.context.events);
                state.set_status(TaskStatus::Succeeded);
                debug!("Task {} finished", state.uid());
            }
            Err(TaskError::Canceled) => {
                state.set_status(TaskStatus::Canceled);
                debug!("Task {} canceled", state.uid());
            }
            Err(err) => {
                state.set_status(TaskStatus::Failed);
                if !err.is_silent() {
                    if let Some(log) = err.log_details() {
                        state.append_log(log);
                    }
                    let text = {
                        let message = state.error_message();
                        if message.is_empty() {
                            err.to_string()
                        } else {
                            message
                        }
                    };
                    let log = state.log_details();
                    self.context.events.warn(text, (!log.is_empty()).then_some(log));
                }
                debug!("Task {} failed: {}", state.uid(), err);
            }
        }
        self.task_done(&task);
        state.signal_done();
    }

    /// Removes a finished task from its owner's collection. Runs for
    /// every task, whatever its outcome. During teardown it returns
    /// early; the bulk-cancel path owns the bookkeeping then.
    fn task_done(&self, task: &Arc<dyn ClipTask>) {
        if self.is_blocked() {
            return;
        }
        let state = task.state();
        let item_id = state.owner().item_id;
        {
            let mut tasks = self.tasks.write().unwrap();
            if let Some(list) = tasks.get_mut(&item_id) {
                list.retain(|t| t.state().uid() != state.uid());
                if list.is_empty() {
                    tasks.remove(&item_id);
                }
            }
        }
        self.emit_task_count();
        self.context
            .events
            .emit(EngineEvent::TaskDone { task: Arc::clone(task) });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether a non-terminal task of the given kind exists for a clip.
    /// An absent clip reads the same as an empty collection.
    pub fn has_pending_task(&self, item_id: ClipId, filter: KindFilter) -> bool {
        let tasks = self.tasks.read().unwrap();
        tasks
            .get(&item_id)
            .map(|list| {
                list.iter()
                    .any(|t| filter.matches(t.state().kind()) && t.state().is_pending())
            })
            .unwrap_or(false)
    }

    /// Most advanced lifecycle state among a clip's tasks
    pub fn job_status(&self, item_id: ClipId) -> Option<TaskStatus> {
        let tasks = self.tasks.read().unwrap();
        let list = tasks.get(&item_id)?;
        if list.iter().any(|t| t.state().is_running()) {
            return Some(TaskStatus::Running);
        }
        if list.iter().any(|t| t.state().is_pending()) {
            return Some(TaskStatus::Queued);
        }
        None
    }

    /// Mean progress over a clip's tasks; 100 when none exist (no
    /// pending work means fully done, not zero done).
    pub fn progress_for_clip(&self, item_id: ClipId) -> i32 {
        let tasks = self.tasks.read().unwrap();
        match tasks.get(&item_id) {
            None => 100,
            Some(list) if list.is_empty() => 100,
            Some(list) => {
                let total: i64 = list.iter().map(|t| t.state().progress() as i64).sum();
                (total / list.len() as i64) as i32
            }
        }
    }

    /// Tasks currently registered for a clip
    pub fn tasks_for_clip(&self, item_id: ClipId) -> Vec<Arc<dyn ClipTask>> {
        self.tasks
            .read()
            .unwrap()
            .get(&item_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of non-terminal tasks across all clips
    pub fn pending_count(&self) -> usize {
        let tasks = self.tasks.read().unwrap();
        tasks
            .values()
            .flat_map(|list| list.iter())
            .filter(|t| t.state().is_pending())
            .count()
    }

    fn emit_task_count(&self) {
        self.context
            .events
            .emit(EngineEvent::TaskCount(self.pending_count()));
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancels matching unfinished tasks for a clip and blocks until
    /// each worker has observed the cancellation and unwound. After this
    /// returns the caller may safely destroy or mutate the clip.
    pub async fn discard_tasks(
        &self,
        item_id: ClipId,
        filter: KindFilter,
        soft_delete: bool,
        exceptions: &[TaskUid],
    ) {
        let victims: Vec<Arc<dyn ClipTask>> = {
            let tasks = self.tasks.read().unwrap();
            tasks
                .get(&item_id)
                .map(|list| {
                    list.iter()
                        .filter(|t| {
                            let state = t.state();
                            filter.matches(state.kind())
                                && state.progress() < 100
                                && !exceptions.contains(state.uid())
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if victims.is_empty() {
            return;
        }
        info!(
            "Discarding {} task(s) for clip {} (soft={})",
            victims.len(),
            item_id,
            soft_delete
        );
        for task in &victims {
            task.state().cancel(soft_delete);
        }
        for task in &victims {
            task.state().wait_done().await;
        }
    }

    /// Global teardown: rejects new submissions, cancels and waits on
    /// every task not excepted, then drains both pools before clearing
    /// the bookkeeping and leaving teardown mode.
    pub async fn cancel_all(&self, exceptions: &[TaskUid]) {
        self.blocked.store(true, Ordering::SeqCst);
        let victims: Vec<Arc<dyn ClipTask>> = {
            let tasks = self.tasks.read().unwrap();
            tasks
                .values()
                .flat_map(|list| list.iter())
                .filter(|t| !exceptions.contains(t.state().uid()))
                .cloned()
                .collect()
        };
        info!("Canceling {} task(s)", victims.len());
        for task in &victims {
            task.state().cancel(false);
        }
        for task in &victims {
            task.state().wait_done().await;
        }
        self.general_pool.drain().await;
        self.encode_pool.drain().await;
        {
            let mut tasks = self.tasks.write().unwrap();
            if exceptions.is_empty() {
                tasks.clear();
            } else {
                tasks.retain(|_, list| {
                    list.retain(|t| {
                        exceptions.contains(t.state().uid()) && t.state().is_pending()
                    });
                    !list.is_empty()
                });
            }
        }
        self.blocked.store(false, Ordering::SeqCst);
        self.emit_task_count();
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("pending", &self.pending_count())
            .field("blocked", &self.is_blocked())
            .field("general_pool", &self.general_pool)
            .field("encode_pool", &self.encode_pool)
            .finish()
    }
}
