//! Cooperative cancellation.
//!
//! Preparation work checks a [`TerminationFlag`] at its suspension points:
//! row intake, fold joins, sub-DAG boundaries. Raising the flag never
//! interrupts a task mid-row; tasks notice at the next check and unwind
//! with `PrepareError::Cancelled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag. Clones observe the same state.
#[derive(Clone, Debug)]
pub struct TerminationFlag {
    stopped: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl TerminationFlag {
    /// A flag in the running state.
    pub fn running_true() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            ancestors: Vec::new(),
        }
    }

    /// Whether work should continue.
    pub fn running(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        !self
            .ancestors
            .iter()
            .any(|flag| flag.load(Ordering::Acquire))
    }

    /// Requests cancellation. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// A child flag: raised when this flag or any of its ancestors is
    /// raised, but whose own `stop` leaves them untouched. Inner task
    /// pools use children so one fold's failure stops its siblings without
    /// cancelling the whole outer preparation.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.stopped));
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::running_true()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_by_default() {
        let flag = TerminationFlag::default();
        assert!(flag.running());
    }

    #[test]
    fn test_stop_is_shared_across_clones() {
        let flag = TerminationFlag::running_true();
        let other = flag.clone();
        other.stop();
        assert!(!flag.running());
        assert!(!other.running());
    }

    #[test]
    fn test_child_sees_parent_stop() {
        let parent = TerminationFlag::running_true();
        let child = parent.child();
        assert!(child.running());
        parent.stop();
        assert!(!child.running());
    }

    #[test]
    fn test_grandchild_sees_root_stop() {
        let root = TerminationFlag::running_true();
        let grandchild = root.child().child();
        root.stop();
        assert!(!grandchild.running());
    }

    #[test]
    fn test_child_stop_does_not_raise_parent() {
        let parent = TerminationFlag::running_true();
        let child = parent.child();
        child.stop();
        assert!(!child.running());
        assert!(parent.running());
    }

    #[test]
    fn test_sibling_children_are_independent() {
        let parent = TerminationFlag::running_true();
        let a = parent.child();
        let b = parent.child();
        a.stop();
        assert!(!a.running());
        assert!(b.running());
    }
}
