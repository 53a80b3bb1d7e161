//! Batch scheduler for legacy jobs.
//!
//! One batch groups the job instances of a conceptual operation over
//! several clips. Batches may declare a parent; a child is submitted
//! only after the parent's commit step completed. Exactly one undo
//! push happens per batch, under the batch's label, and only when every
//! instance committed successfully.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ClipJob, UndoAccumulator};
use crate::events::EngineEvent;
use crate::tasks::TaskContext;
use crate::undo::SharedUndoStack;
use crate::{BatchId, ClipId, NO_PARENT_BATCH};

/// Lifecycle of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Running,
    Finished,
    Canceled,
}

/// One unit of work: the ordered jobs of a conceptual operation.
pub struct JobBatch {
    id: BatchId,
    jobs: Vec<Arc<dyn ClipJob>>,
    /// Clip id to index into `jobs`
    indices: HashMap<ClipId, usize>,
    undo_label: Option<String>,
    started: AtomicBool,
    /// Flips exactly once; any later finish/cancel signal is a no-op
    processed: AtomicBool,
    failed: AtomicBool,
    canceled: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl JobBatch {
    fn new(id: BatchId, jobs: Vec<Arc<dyn ClipJob>>, undo_label: Option<String>) -> Arc<Self> {
        let indices = jobs
            .iter()
            .enumerate()
            .map(|(index, job)| (job.clip_id(), index))
            .collect();
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            jobs,
            indices,
            undo_label,
            started: AtomicBool::new(false),
            processed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            done_tx,
            done_rx,
        })
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn status(&self) -> BatchStatus {
        if self.processed.load(Ordering::SeqCst) {
            if self.canceled.load(Ordering::SeqCst) {
                return BatchStatus::Canceled;
            }
            return BatchStatus::Finished;
        }
        if self.started.load(Ordering::SeqCst) {
            return BatchStatus::Running;
        }
        BatchStatus::Pending
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> bool {
        self.is_processed()
            && !self.failed.load(Ordering::SeqCst)
            && !self.canceled.load(Ordering::SeqCst)
    }

    /// Progress of the job processing the given clip
    pub fn progress_for_clip(&self, clip_id: ClipId) -> Option<i32> {
        let index = *self.indices.get(&clip_id)?;
        Some(self.jobs[index].job_state().progress())
    }

    /// Resolves once the batch's completion handler has fully run
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn mark_processed(&self) -> bool {
        !self.processed.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for JobBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBatch")
            .field("id", &self.id)
            .field("jobs", &self.jobs.len())
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Default)]
struct SchedulerState {
    batches: HashMap<BatchId, Arc<JobBatch>>,
    by_clip: HashMap<ClipId, Vec<BatchId>>,
    children: HashMap<BatchId, Vec<BatchId>>,
}

/// Runs batches over pooled futures and orders dependents after their
/// parents.
pub struct JobScheduler {
    state: RwLock<SchedulerState>,
    ctx: Arc<TaskContext>,
    undo_stack: SharedUndoStack,
    next_id: AtomicI32,
}

impl JobScheduler {
    pub fn new(ctx: Arc<TaskContext>, undo_stack: SharedUndoStack) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(SchedulerState::default()),
            ctx,
            undo_stack,
            next_id: AtomicI32::new(0),
        })
    }

    /// Creates one job per clip through the factory and submits the
    /// batch, unless `parent` is still unfinished — then the batch
    /// waits and is submitted from the parent's completion handler.
    pub fn start_job<F>(
        self: &Arc<Self>,
        clip_ids: &[ClipId],
        parent: BatchId,
        undo_label: Option<String>,
        factory: F,
    ) -> BatchId
    where
        F: Fn(ClipId) -> Arc<dyn ClipJob>,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let jobs: Vec<Arc<dyn ClipJob>> = clip_ids.iter().map(|clip| factory(*clip)).collect();
        let batch = JobBatch::new(id, jobs, undo_label);

        let submit_now = {
            let mut state = self.state.write().unwrap();
            state.batches.insert(id, Arc::clone(&batch));
            for clip in clip_ids {
                state.by_clip.entry(*clip).or_default().push(id);
            }
            if parent == NO_PARENT_BATCH {
                true
            } else {
                match state.batches.get(&parent) {
                    Some(parent_batch) if !parent_batch.is_processed() => {
                        debug!("Batch {} queued behind parent {}", id, parent);
                        state.children.entry(parent).or_default().push(id);
                        false
                    }
                    _ => true,
                }
            }
        };
        self.emit_job_count();
        if submit_now {
            self.spawn_batch(batch);
        }
        id
    }

    /// Live handle for a batch (absent once its completion handler ran)
    pub fn batch(&self, id: BatchId) -> Option<Arc<JobBatch>> {
        self.state.read().unwrap().batches.get(&id).cloned()
    }

    /// First unfinished batch registered for a clip
    pub fn blocking_batch(&self, clip_id: ClipId) -> Option<BatchId> {
        let state = self.state.read().unwrap();
        state
            .by_clip
            .get(&clip_id)?
            .iter()
            .find(|id| {
                state
                    .batches
                    .get(id)
                    .map(|b| !b.is_processed())
                    .unwrap_or(false)
            })
            .copied()
    }

    /// Unfinished batches registered for a clip
    pub fn pending_batches(&self, clip_id: ClipId) -> Vec<BatchId> {
        let state = self.state.read().unwrap();
        state
            .by_clip
            .get(&clip_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        state
                            .batches
                            .get(id)
                            .map(|b| !b.is_processed())
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn batch_status(&self, id: BatchId) -> Option<BatchStatus> {
        self.batch(id).map(|b| b.status())
    }

    /// Number of unfinished batches
    pub fn pending_count(&self) -> usize {
        let state = self.state.read().unwrap();
        state
            .batches
            .values()
            .filter(|b| !b.is_processed())
            .count()
    }

    /// Cancels a batch: every constituent job's future is canceled. The
    /// completion handler then runs the same mark-once/notify steps as
    /// a normal finish but skips the commit entirely.
    pub fn cancel_batch(self: &Arc<Self>, id: BatchId) {
        let Some(batch) = self.batch(id) else {
            return;
        };
        info!("Canceling batch {}", id);
        batch.canceled.store(true, Ordering::SeqCst);
        for job in &batch.jobs {
            job.job_state().cancel();
        }
        if !batch.started.load(Ordering::SeqCst) {
            // Never submitted (queued child): finish it here
            self.finish_batch(&batch, false);
        }
    }

    fn spawn_batch(self: &Arc<Self>, batch: Arc<JobBatch>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            batch.started.store(true, Ordering::SeqCst);
            debug!("Batch {} started with {} job(s)", batch.id, batch.jobs.len());
            let mut handles = Vec::with_capacity(batch.jobs.len());
            for job in &batch.jobs {
                let job = Arc::clone(job);
                let ctx = Arc::clone(&scheduler.ctx);
                handles.push(tokio::spawn(async move { job.run(&ctx).await }));
            }
            let mut ok = true;
            for handle in handles {
                ok &= handle.await.unwrap_or(false);
            }
            scheduler.finish_batch(&batch, ok);
        });
    }

    /// Completion handler; runs exactly once per batch however many
    /// finish/cancel signals arrive.
    fn finish_batch(self: &Arc<Self>, batch: &Arc<JobBatch>, ok: bool) {
        if !batch.mark_processed() {
            return;
        }
        let canceled = batch.canceled.load(Ordering::SeqCst);
        if canceled {
            debug!("Batch {} canceled", batch.id);
        } else if !ok {
            batch.failed.store(true, Ordering::SeqCst);
            self.report_batch_failure(batch);
        } else {
            // Commit in list order, short-circuiting on the first
            // failure; the undo pair is only registered when every
            // instance committed.
            let mut accum = UndoAccumulator::new();
            let mut commit_ok = true;
            for job in &batch.jobs {
                if !job.commit_result(&mut accum) {
                    commit_ok = false;
                    break;
                }
            }
            if commit_ok {
                if let Some(label) = &batch.undo_label {
                    if !accum.is_empty() {
                        let (operation, reverse) = accum.into_pair();
                        self.undo_stack
                            .lock()
                            .unwrap()
                            .push(operation, reverse, label.clone());
                    }
                }
            } else {
                batch.failed.store(true, Ordering::SeqCst);
                self.report_batch_failure(batch);
            }
        }

        for clip in batch.indices.keys() {
            self.ctx
                .events
                .emit(EngineEvent::ClipUpdated { item_id: *clip });
        }

        let children = {
            let mut state = self.state.write().unwrap();
            state.batches.remove(&batch.id);
            for clip in batch.indices.keys() {
                if let Some(ids) = state.by_clip.get_mut(clip) {
                    ids.retain(|id| *id != batch.id);
                    if ids.is_empty() {
                        state.by_clip.remove(clip);
                    }
                }
            }
            state.children.remove(&batch.id).unwrap_or_default()
        };

        let _ = batch.done_tx.send(true);
        self.emit_job_count();

        let propagate_cancel =
            canceled || batch.failed.load(Ordering::SeqCst);
        for child_id in children {
            let Some(child) = self.batch(child_id) else {
                continue;
            };
            if propagate_cancel {
                // A dependent of a failed or canceled parent cannot run
                child.canceled.store(true, Ordering::SeqCst);
                for job in &child.jobs {
                    job.job_state().cancel();
                }
                self.finish_batch(&child, false);
            } else {
                self.spawn_batch(child);
            }
        }
    }

    fn report_batch_failure(&self, batch: &JobBatch) {
        let Some(job) = batch
            .jobs
            .iter()
            .find(|j| !j.job_state().is_successful())
            .or_else(|| batch.jobs.first())
        else {
            return;
        };
        warn!("Batch {} did not finish correctly", batch.id);
        let state = job.job_state();
        let text = {
            let message = state.error_message();
            if message.is_empty() {
                format!("{} failed", job.description())
            } else {
                message
            }
        };
        let log = state.log_details();
        self.ctx.events.warn(text, (!log.is_empty()).then_some(log));
    }

    fn emit_job_count(&self) {
        self.ctx
            .events
            .emit(EngineEvent::TaskCount(self.pending_count()));
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::tasks::testutil::Harness;
    use crate::undo::shared_undo_stack;
    use crate::TaskResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum JobBehavior {
        Succeed,
        SucceedSlow,
        Fail,
        BlockUntilCanceled,
        CommitFails,
    }

    struct ScriptedJob {
        state: JobState,
        clip: ClipId,
        behavior: JobBehavior,
        label: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedJob {
        fn factory(
            behavior: JobBehavior,
            prefix: &str,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> impl Fn(ClipId) -> Arc<dyn ClipJob> {
            let prefix = prefix.to_string();
            let log = Arc::clone(log);
            move |clip| {
                Arc::new(ScriptedJob {
                    state: JobState::new(),
                    clip,
                    behavior,
                    label: format!("{prefix}{clip}"),
                    log: Arc::clone(&log),
                }) as Arc<dyn ClipJob>
            }
        }

        fn note(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}-{}", what, self.label));
        }
    }

    #[async_trait]
    impl ClipJob for ScriptedJob {
        fn job_state(&self) -> &JobState {
            &self.state
        }

        fn clip_id(&self) -> ClipId {
            self.clip
        }

        fn description(&self) -> String {
            format!("scripted job {}", self.label)
        }

        async fn run(&self, _ctx: &crate::tasks::TaskContext) -> bool {
            self.note("run");
            let ok = match self.behavior {
                JobBehavior::Succeed | JobBehavior::CommitFails => true,
                JobBehavior::SucceedSlow => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    !self.state.is_canceled()
                }
                JobBehavior::Fail => {
                    self.state.append_error("scripted failure");
                    false
                }
                JobBehavior::BlockUntilCanceled => {
                    self.state.cancel_token().cancelled().await;
                    false
                }
            };
            self.state.finish(ok);
            ok
        }

        fn commit_result(&self, accum: &mut UndoAccumulator) -> bool {
            if !self.state.begin_commit() {
                return false;
            }
            if matches!(self.behavior, JobBehavior::CommitFails) {
                return false;
            }
            self.note("commit");
            let op_log = Arc::clone(&self.log);
            let rev_log = Arc::clone(&self.log);
            let label = self.label.clone();
            let rev_label = self.label.clone();
            accum.push(
                Box::new(move || {
                    op_log.lock().unwrap().push(format!("op-{label}"));
                    true
                }),
                Box::new(move || {
                    rev_log.lock().unwrap().push(format!("rev-{rev_label}"));
                    true
                }),
            );
            true
        }
    }

    fn scheduler_for(harness: &Harness) -> (Arc<JobScheduler>, SharedUndoStack) {
        let undo = shared_undo_stack();
        let scheduler = JobScheduler::new(Arc::clone(harness.manager.context()), Arc::clone(&undo));
        (scheduler, undo)
    }

    #[tokio::test]
    async fn test_batch_commits_in_order_with_single_undo_push() -> TaskResult<()> {
        let harness = Harness::new();
        let (scheduler, undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = scheduler.start_job(
            &[1, 2],
            NO_PARENT_BATCH,
            Some("Apply filter".into()),
            ScriptedJob::factory(JobBehavior::Succeed, "j", &log),
        );
        let batch = scheduler.batch(id).unwrap();
        batch.wait_done().await;

        assert!(batch.succeeded());
        assert_eq!(scheduler.pending_count(), 0);

        // Exactly one undo entry, under the batch label
        {
            let stack = undo.lock().unwrap();
            assert_eq!(stack.undo_count(), 1);
            assert_eq!(stack.last_label(), Some("Apply filter"));
        }

        // Commits ran in list order
        let seen = log.lock().unwrap().clone();
        let commits: Vec<_> = seen.iter().filter(|l| l.starts_with("commit-")).collect();
        assert_eq!(commits, vec!["commit-j1", "commit-j2"]);

        // The composed reverse unwinds both instances
        assert!(undo.lock().unwrap().undo());
        let seen = log.lock().unwrap().clone();
        let revs: Vec<_> = seen.iter().filter(|l| l.starts_with("rev-")).collect();
        assert_eq!(revs, vec!["rev-j2", "rev-j1"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_child_batch_waits_for_parent_commit() {
        let harness = Harness::new();
        let (scheduler, _undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let parent = scheduler.start_job(
            &[1],
            NO_PARENT_BATCH,
            Some("parent".into()),
            ScriptedJob::factory(JobBehavior::SucceedSlow, "p", &log),
        );
        let child = scheduler.start_job(
            &[2],
            parent,
            Some("child".into()),
            ScriptedJob::factory(JobBehavior::Succeed, "c", &log),
        );
        let child_batch = scheduler.batch(child).unwrap();
        assert_eq!(child_batch.status(), BatchStatus::Pending);
        child_batch.wait_done().await;

        let seen = log.lock().unwrap().clone();
        let parent_commit = seen.iter().position(|l| l == "commit-p1").unwrap();
        let child_run = seen.iter().position(|l| l == "run-c2").unwrap();
        assert!(
            parent_commit < child_run,
            "child ran before parent committed: {:?}",
            seen
        );
    }

    #[tokio::test]
    async fn test_child_of_finished_parent_starts_immediately() {
        let harness = Harness::new();
        let (scheduler, _undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let parent = scheduler.start_job(
            &[1],
            NO_PARENT_BATCH,
            None,
            ScriptedJob::factory(JobBehavior::Succeed, "p", &log),
        );
        scheduler.batch(parent).unwrap().wait_done().await;

        let child = scheduler.start_job(
            &[2],
            parent,
            None,
            ScriptedJob::factory(JobBehavior::Succeed, "c", &log),
        );
        let child_batch = scheduler.batch(child).unwrap();
        child_batch.wait_done().await;
        assert!(child_batch.succeeded());
    }

    #[tokio::test]
    async fn test_failed_run_skips_commit_and_undo() {
        let mut harness = Harness::new();
        let (scheduler, undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = scheduler.start_job(
            &[1, 2],
            NO_PARENT_BATCH,
            Some("won't appear".into()),
            ScriptedJob::factory(JobBehavior::Fail, "f", &log),
        );
        let batch = scheduler.batch(id).unwrap();
        batch.wait_done().await;

        assert!(!batch.succeeded());
        assert!(!undo.lock().unwrap().can_undo());
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("commit-")));

        // Failure surfaced as a user-visible warning
        let warned = harness
            .drain_events()
            .into_iter()
            .any(|ev| matches!(ev, EngineEvent::Message { .. }));
        assert!(warned);
    }

    #[tokio::test]
    async fn test_commit_failure_prevents_undo_push() {
        let harness = Harness::new();
        let (scheduler, undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = scheduler.start_job(
            &[1],
            NO_PARENT_BATCH,
            Some("nope".into()),
            ScriptedJob::factory(JobBehavior::CommitFails, "x", &log),
        );
        let batch = scheduler.batch(id).unwrap();
        batch.wait_done().await;

        assert!(!batch.succeeded());
        assert!(!undo.lock().unwrap().can_undo());
    }

    #[tokio::test]
    async fn test_cancel_batch_skips_commit() {
        let harness = Harness::new();
        let (scheduler, undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = scheduler.start_job(
            &[1],
            NO_PARENT_BATCH,
            Some("canceled".into()),
            ScriptedJob::factory(JobBehavior::BlockUntilCanceled, "b", &log),
        );
        let batch = scheduler.batch(id).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.cancel_batch(id);
        batch.wait_done().await;

        assert_eq!(batch.status(), BatchStatus::Canceled);
        assert!(!undo.lock().unwrap().can_undo());
        assert!(log.lock().unwrap().iter().all(|l| !l.starts_with("commit-")));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_children_of_canceled_parent_are_canceled() {
        let harness = Harness::new();
        let (scheduler, _undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        let parent = scheduler.start_job(
            &[1],
            NO_PARENT_BATCH,
            None,
            ScriptedJob::factory(JobBehavior::BlockUntilCanceled, "p", &log),
        );
        let child = scheduler.start_job(
            &[2],
            parent,
            None,
            ScriptedJob::factory(JobBehavior::Succeed, "c", &log),
        );
        let child_batch = scheduler.batch(child).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.cancel_batch(parent);
        child_batch.wait_done().await;

        assert_eq!(child_batch.status(), BatchStatus::Canceled);
        assert!(log.lock().unwrap().iter().all(|l| l != "run-c2"));
    }

    #[tokio::test]
    async fn test_blocking_batch_query() {
        let harness = Harness::new();
        let (scheduler, _undo) = scheduler_for(&harness);
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(scheduler.blocking_batch(7).is_none());
        let id = scheduler.start_job(
            &[7],
            NO_PARENT_BATCH,
            None,
            ScriptedJob::factory(JobBehavior::BlockUntilCanceled, "b", &log),
        );
        assert_eq!(scheduler.blocking_batch(7), Some(id));
        assert_eq!(scheduler.pending_batches(7), vec![id]);

        let batch = scheduler.batch(id).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.batch_status(id), Some(BatchStatus::Running));
        assert_eq!(batch.progress_for_clip(7), Some(0));
        assert_eq!(batch.progress_for_clip(999), None);

        scheduler.cancel_batch(id);
        batch.wait_done().await;
        assert!(scheduler.blocking_batch(7).is_none());
        assert!(scheduler.pending_batches(7).is_empty());
    }
}
