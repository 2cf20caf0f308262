//! Concurrency level and bounded task pools for meta-preparers.
//!
//! Coarse-grained parallel work (fold finishes, candidate evaluation) runs
//! on a rayon pool created for the preparer's lifetime and joined on every
//! exit path. Streaming intake stays cooperative on the caller's thread.

use crate::error::{PrepareError, Result};
use crate::termination::TerminationFlag;
use std::num::NonZeroUsize;

/// A degree of parallelism, always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Concurrency {
    value: NonZeroUsize,
}

impl Concurrency {
    /// Creates a concurrency level; `None` if `value` is 0.
    pub fn new(value: usize) -> Option<Self> {
        NonZeroUsize::new(value).map(|v| Self { value: v })
    }

    /// Creates a concurrency level.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0.
    pub fn of(value: usize) -> Self {
        Self::new(value)
            .unwrap_or_else(|| panic!("concurrency must be at least 1, got {}", value))
    }

    pub fn available_cores() -> Self {
        Self::of(num_cpus::get())
    }

    pub fn single_threaded() -> Self {
        Self::of(1)
    }

    pub fn value(self) -> usize {
        self.value.get()
    }

    /// Caps this level at `tasks`, the pool size rule for inner fold and
    /// candidate work: `min(tasks, available_parallelism)`.
    pub fn capped_at(self, tasks: usize) -> Self {
        Self::of(self.value().min(tasks.max(1)))
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::available_cores()
    }
}

/// Runs independent finish-style tasks on a dedicated pool, joining all of
/// them before returning.
///
/// The pool lives exactly as long as this call. On the first task error the
/// termination flag is raised so sibling tasks can exit at their next
/// suspension point, the pool is drained, and the first error (in task
/// order) is returned. Cancellation observed by any task surfaces as
/// [`PrepareError::Cancelled`].
pub fn run_all<T, F>(
    concurrency: Concurrency,
    termination: &TerminationFlag,
    tasks: Vec<F>,
) -> Result<Vec<T>>
where
    T: Send,
    F: FnOnce(&TerminationFlag) -> Result<T> + Send,
{
    if !termination.running() {
        return Err(PrepareError::Cancelled);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.capped_at(tasks.len()).value())
        .build()
        .map_err(|e| PrepareError::inner(format!("failed to build task pool: {}", e)))?;

    let inner = termination.child();
    let mut slots: Vec<Option<Result<T>>> = Vec::with_capacity(tasks.len());
    slots.resize_with(tasks.len(), || None);

    pool.install(|| {
        rayon::scope(|scope| {
            for (slot, task) in slots.iter_mut().zip(tasks) {
                let flag = inner.clone();
                scope.spawn(move |_| {
                    let outcome = if flag.running() {
                        task(&flag)
                    } else {
                        Err(PrepareError::Cancelled)
                    };
                    if outcome.is_err() {
                        flag.stop();
                    }
                    *slot = Some(outcome);
                });
            }
        });
    });

    if !termination.running() {
        return Err(PrepareError::Cancelled);
    }

    // Siblings of a failing task observe the raised child flag and report
    // Cancelled; the failing task's own error takes precedence.
    let mut values = Vec::with_capacity(slots.len());
    let mut cancelled = false;
    let mut first_error = None;
    for slot in slots {
        match slot.expect("task joined") {
            Ok(value) => values.push(value),
            Err(PrepareError::Cancelled) => cancelled = true,
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if cancelled {
        return Err(PrepareError::Cancelled);
    }
    Ok(values)
}
