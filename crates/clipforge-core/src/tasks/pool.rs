//! Bounded priority worker pool.
//!
//! Workers are tokio tasks looping over a shared priority queue. Two
//! pools exist in a running engine: a general pool sized to the machine
//! and a constrained encode pool for jobs that contend for hardware
//! encoders (see the task manager). A pool's worker target can change
//! at runtime; shrinking takes effect as running workers finish their
//! current entry.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::{debug, trace};

use super::manager::TaskManager;
use super::ClipTask;

/// Entry in the pool queue; higher priority pops first, FIFO within a
/// priority level.
struct PoolEntry {
    priority: i32,
    seq: u64,
    task: Arc<dyn ClipTask>,
}

impl PartialEq for PoolEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PoolEntry {}

impl PartialOrd for PoolEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A bounded set of workers draining one priority queue.
pub struct WorkerPool {
    name: &'static str,
    queue: Mutex<BinaryHeap<PoolEntry>>,
    seq: AtomicU64,
    /// Desired worker count; workers above it exit after their current
    /// entry
    target: AtomicUsize,
    /// Currently spawned workers
    spawned: AtomicUsize,
    /// Workers executing a task body right now
    active: AtomicUsize,
    work_notify: Notify,
    idle_notify: Notify,
    manager: Mutex<Weak<TaskManager>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            target: AtomicUsize::new(workers.max(1)),
            spawned: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            work_notify: Notify::new(),
            idle_notify: Notify::new(),
            manager: Mutex::new(Weak::new()),
        })
    }

    /// Binds the pool to its owning manager; must happen before the
    /// first submit.
    pub(crate) fn attach(&self, manager: &Arc<TaskManager>) {
        *self.manager.lock().unwrap() = Arc::downgrade(manager);
    }

    /// Queues a task at the given priority and wakes a worker.
    pub(crate) fn submit(self: &Arc<Self>, task: Arc<dyn ClipTask>, priority: i32) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push(PoolEntry {
                priority,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                task,
            });
        }
        self.ensure_workers();
        self.work_notify.notify_one();
    }

    /// Changes the worker target. Takes effect for subsequently
    /// submitted tasks; excess workers retire after their current entry.
    pub fn set_target(self: &Arc<Self>, workers: usize) {
        self.target.store(workers.max(1), Ordering::SeqCst);
        self.ensure_workers();
        // Wake idle workers so retired slots notice the shrink
        self.work_notify.notify_waiters();
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_workers(self: &Arc<Self>) {
        loop {
            let spawned = self.spawned.load(Ordering::SeqCst);
            if spawned >= self.target.load(Ordering::SeqCst) {
                return;
            }
            if self
                .spawned
                .compare_exchange(spawned, spawned + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let pool = Arc::clone(self);
            let worker_id = spawned;
            tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("{} pool worker {} started", self.name, worker_id);
        loop {
            if worker_id >= self.target.load(Ordering::SeqCst) {
                break;
            }
            let notified = self.work_notify.notified();
            let entry = {
                let mut queue = self.queue.lock().unwrap();
                let entry = queue.pop();
                if entry.is_some() {
                    // Claim the slot before the queue lock drops so a
                    // drain never observes empty-and-idle mid-handoff
                    self.active.fetch_add(1, Ordering::SeqCst);
                }
                entry
            };
            match entry {
                Some(entry) => {
                    let manager = self.manager.lock().unwrap().upgrade();
                    if let Some(manager) = manager {
                        trace!(
                            "{} pool worker {} picked task {}",
                            self.name,
                            worker_id,
                            entry.task.state().uid()
                        );
                        manager.run_one(entry.task).await;
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.idle_notify.notify_waiters();
                }
                None => {
                    self.idle_notify.notify_waiters();
                    notified.await;
                }
            }
        }
        self.spawned.fetch_sub(1, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
        debug!("{} pool worker {} retired", self.name, worker_id);
    }

    /// Resolves when no queued entries remain and no worker is
    /// executing a task body. Used by global cancellation so teardown
    /// never races an in-flight worker.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle_notify.notified();
            let idle = {
                let queue = self.queue.lock().unwrap();
                queue.is_empty() && self.active.load(Ordering::SeqCst) == 0
            };
            if idle {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("target", &self.target())
            .field("queued", &self.queue_len())
            .field("active", &self.active_count())
            .finish()
    }
}
