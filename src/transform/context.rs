//! Preparation context handed to preparable transformers.

use crate::concurrency::Concurrency;
use crate::dag::executor::{LocalExecutor, PreparedDag};
use crate::dag::Dag;
use crate::data::RowReader;
use crate::error::Result;
use crate::termination::TerminationFlag;
use std::sync::Arc;

/// Executor surface reachable from a preparer.
///
/// Meta-transformers that construct internal sub-DAGs (the best-model
/// selector) submit them back through this handle instead of a global
/// registry.
pub trait SubDagExecutor: Send + Sync {
    fn prepare_sub_dag(&self, dag: &Dag, data: &RowReader) -> Result<PreparedDag>;

    fn parallelism(&self) -> Concurrency;
}

/// Everything a preparable transformer learns about the execution it is
/// being prepared under.
#[derive(Clone)]
pub struct PreparerContext {
    estimated_example_count: u64,
    min_example_count: u64,
    concurrency: Concurrency,
    termination: TerminationFlag,
    executor: Arc<dyn SubDagExecutor>,
}

impl PreparerContext {
    /// Context for a preparation driven outside any executor (tests,
    /// direct use). Sub-DAG work falls back to a local executor.
    pub fn standalone(estimated_example_count: u64) -> Self {
        Self {
            estimated_example_count,
            min_example_count: 0,
            concurrency: Concurrency::available_cores(),
            termination: TerminationFlag::running_true(),
            executor: Arc::new(LocalExecutor::default()),
        }
    }

    pub fn new(
        estimated_example_count: u64,
        concurrency: Concurrency,
        termination: TerminationFlag,
        executor: Arc<dyn SubDagExecutor>,
    ) -> Self {
        Self {
            estimated_example_count,
            min_example_count: 0,
            concurrency,
            termination,
            executor,
        }
    }

    /// Derived context for a child preparer seeing a subset of the data,
    /// e.g. one cross-training fold.
    pub fn scaled(&self, estimated_example_count: u64, min_example_count: u64) -> Self {
        let mut child = self.clone();
        child.estimated_example_count = estimated_example_count;
        child.min_example_count = min_example_count;
        child
    }

    /// Derived context whose cancellation is independent of (but still
    /// subordinate to) this one.
    pub fn with_termination(&self, termination: TerminationFlag) -> Self {
        let mut child = self.clone();
        child.termination = termination;
        child
    }

    pub fn estimated_example_count(&self) -> u64 {
        self.estimated_example_count
    }

    pub fn min_example_count(&self) -> u64 {
        self.min_example_count
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn termination(&self) -> &TerminationFlag {
        &self.termination
    }

    pub fn executor(&self) -> &dyn SubDagExecutor {
        self.executor.as_ref()
    }
}
