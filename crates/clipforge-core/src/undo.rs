//! Undo/Redo Sink
//!
//! Successful jobs produce a pair of zero-argument closures: `operation`
//! applies the computed result to shared project state, `reverse`
//! restores the prior state. The stack only stores and replays the
//! pairs; it never inspects what they do. Contract relied upon by every
//! producer: `operation`, then `reverse`, then `operation` must be
//! behaviorally identical to `operation` alone.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Side-effecting state closure; returns false when the mutation could
/// not be applied.
pub type StateOp = Box<dyn Fn() -> bool + Send + Sync>;

/// Makes an operation that does nothing and always succeeds
pub fn noop_op() -> StateOp {
    Box::new(|| true)
}

/// Entry in the undo history
pub struct UndoEntry {
    /// Applies the result (already applied once when pushed)
    pub operation: StateOp,
    /// Restores the prior state
    pub reverse: StateOp,
    /// Human-readable label
    pub label: String,
    /// When the entry was pushed
    pub timestamp: String,
}

impl std::fmt::Debug for UndoEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoEntry")
            .field("label", &self.label)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Stores undo/redo pairs produced by committed jobs
#[derive(Debug)]
pub struct UndoStack {
    undo_stack: VecDeque<UndoEntry>,
    redo_stack: VecDeque<UndoEntry>,
    max_history_size: usize,
}

impl UndoStack {
    pub fn new() -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: 100,
        }
    }

    /// Sets the maximum history size
    pub fn with_max_history(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    /// Registers a committed operation/reverse pair.
    ///
    /// The operation has already been applied by the commit step; the
    /// stack does not re-run it here. Pushing clears the redo stack.
    pub fn push(&mut self, operation: StateOp, reverse: StateOp, label: impl Into<String>) {
        self.redo_stack.clear();
        self.undo_stack.push_back(UndoEntry {
            operation,
            reverse,
            label: label.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        while self.undo_stack.len() > self.max_history_size {
            self.undo_stack.pop_front();
        }
    }

    /// Undoes the most recent entry. Returns false when there is nothing
    /// to undo or the reverse closure reported failure.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.undo_stack.pop_back() else {
            return false;
        };
        let ok = (entry.reverse)();
        self.redo_stack.push_back(entry);
        ok
    }

    /// Redoes the most recently undone entry.
    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.redo_stack.pop_back() else {
            return false;
        };
        let ok = (entry.operation)();
        self.undo_stack.push_back(entry);
        ok
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Label of the entry `undo` would apply next
    pub fn last_label(&self) -> Option<&str> {
        self.undo_stack.back().map(|e| e.label.as_str())
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Undo stack shared between the engine and its consumer
pub type SharedUndoStack = Arc<Mutex<UndoStack>>;

/// Creates a shared undo stack
pub fn shared_undo_stack() -> SharedUndoStack {
    Arc::new(Mutex::new(UndoStack::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counter_pair(counter: &Arc<AtomicI32>) -> (StateOp, StateOp) {
        let up = Arc::clone(counter);
        let down = Arc::clone(counter);
        (
            Box::new(move || {
                up.fetch_add(1, Ordering::SeqCst);
                true
            }),
            Box::new(move || {
                down.fetch_sub(1, Ordering::SeqCst);
                true
            }),
        )
    }

    #[test]
    fn test_undo_redo_cycle() {
        let counter = Arc::new(AtomicI32::new(1));
        let mut stack = UndoStack::new();
        let (op, rev) = counter_pair(&counter);
        stack.push(op, rev, "bump");

        assert!(stack.undo());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(stack.redo());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undo_empty_returns_false() {
        let mut stack = UndoStack::new();
        assert!(!stack.undo());
        assert!(!stack.redo());
    }

    #[test]
    fn test_push_clears_redo() {
        let counter = Arc::new(AtomicI32::new(0));
        let mut stack = UndoStack::new();
        let (op, rev) = counter_pair(&counter);
        stack.push(op, rev, "first");
        stack.undo();
        assert!(stack.can_redo());

        let (op, rev) = counter_pair(&counter);
        stack.push(op, rev, "second");
        assert!(!stack.can_redo());
        assert_eq!(stack.last_label(), Some("second"));
    }

    #[test]
    fn test_max_history_trims_oldest() {
        let counter = Arc::new(AtomicI32::new(0));
        let mut stack = UndoStack::new().with_max_history(2);
        for i in 0..5 {
            let (op, rev) = counter_pair(&counter);
            stack.push(op, rev, format!("entry {i}"));
        }
        assert_eq!(stack.undo_count(), 2);
    }
}
