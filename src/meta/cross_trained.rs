//! K-fold cross-training.
//!
//! Trains k sub-models of a wrapped preparable transformer, each on the
//! k−1 folds that exclude its own, plus (by default) one retrained model
//! on all data. Inference on preparation data dispatches each row to the
//! sub-model whose fold excluded it, so no training row is ever scored by
//! a model that saw it; new data goes to the retrained model.
//!
//! The trailing input is the group column: rows with the same group value
//! land in the same fold, and the assignment is a pure function of
//! `(group, fold_count, seed)`; identical on every machine and run.

use crate::concurrency::run_all;
use crate::dag::{ProducerHandle, ProducerNode};
use crate::data::RowReader;
use crate::error::{PrepareError, Result};
use crate::transform::{
    ExecutionCache, PreparableTransformer, PreparedTransformer, Preparer, PreparerContext,
    PreparerMode, PreparerResult,
};
use crate::values::{stable_hash, Value};
use std::sync::Arc;

/// Fixed 64-bit avalanche (the splitmix64 finalizer); the constants are
/// part of the fold-assignment contract.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The fold a group value belongs to: `|mix64(hash(group) ^ seed)| mod k`.
pub fn fold_assignment(group: &Value, fold_count: usize, seed: u64) -> usize {
    let mixed = mix64(stable_hash(group) ^ seed);
    ((mixed as i64).unsigned_abs() % fold_count as u64) as usize
}

/// K-fold cross-training wrapper around a preparable transformer.
pub struct CrossTrained {
    wrapped: Arc<dyn PreparableTransformer>,
    fold_count: usize,
    seed: u64,
    retrain_for_new_data: bool,
    name: String,
}

impl std::fmt::Debug for CrossTrained {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossTrained")
            .field("wrapped", &self.wrapped.name())
            .field("fold_count", &self.fold_count)
            .field("seed", &self.seed)
            .field("retrain_for_new_data", &self.retrain_for_new_data)
            .field("name", &self.name)
            .finish()
    }
}

impl CrossTrained {
    pub const DEFAULT_FOLD_COUNT: usize = 5;

    pub fn new(wrapped: Arc<dyn PreparableTransformer>) -> Self {
        let name = format!("cross-trained({})", wrapped.name());
        Self {
            wrapped,
            fold_count: Self::DEFAULT_FOLD_COUNT,
            seed: 0,
            retrain_for_new_data: true,
            name,
        }
    }

    /// Copy with `k` folds; `k` must be at least 2.
    pub fn with_fold_count(mut self, fold_count: usize) -> Result<Self> {
        if fold_count < 2 {
            return Err(PrepareError::argument(
                "fold_count",
                format!("must be at least 2, got {}", fold_count),
            ));
        }
        self.fold_count = fold_count;
        Ok(self)
    }

    /// Copy with a perturbed fold assignment.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Copy toggling the additional model trained on all data.
    pub fn with_retrain_for_new_data(mut self, retrain: bool) -> Self {
        self.retrain_for_new_data = retrain;
        self
    }

    /// DAG node over the wrapped transformer's inputs plus a trailing
    /// group input; the group defaults to the per-row example index.
    pub fn node(
        self,
        wrapped_inputs: Vec<ProducerHandle>,
        group_input: Option<ProducerHandle>,
    ) -> ProducerHandle {
        let mut inputs = wrapped_inputs;
        inputs.push(group_input.unwrap_or_else(ProducerNode::example_index));
        ProducerNode::preparable(Arc::new(self), inputs)
    }
}

impl PreparableTransformer for CrossTrained {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.wrapped.arity().map(|a| a + 1)
    }

    fn is_idempotent(&self) -> bool {
        self.wrapped.is_idempotent()
    }

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>> {
        let estimated = context.estimated_example_count();
        let fold_estimate = estimated * (self.fold_count as u64 - 1) / self.fold_count as u64;
        // A fold can be empty, so every child preparer accepts zero rows.
        let fold_context = context.scaled(fold_estimate, 0);

        let mut fold_preparers = Vec::with_capacity(self.fold_count);
        for _ in 0..self.fold_count {
            fold_preparers.push(self.wrapped.preparer(&fold_context)?);
        }
        let retrain_preparer = if self.retrain_for_new_data {
            Some(self.wrapped.preparer(&context.scaled(estimated, 0))?)
        } else {
            None
        };

        let mode = fold_preparers[0].mode();
        let mixed = fold_preparers
            .iter()
            .map(|p| p.mode())
            .chain(retrain_preparer.iter().map(|p| p.mode()))
            .any(|m| m != mode);
        if mixed {
            return Err(PrepareError::configuration(
                &self.name,
                "fold preparers disagree on preparer mode",
            ));
        }

        Ok(Box::new(CrossTrainedPreparer {
            name: self.name.clone(),
            fold_preparers,
            retrain_preparer,
            mode,
            fold_count: self.fold_count,
            seed: self.seed,
            context: context.clone(),
        }))
    }
}

struct CrossTrainedPreparer {
    name: String,
    fold_preparers: Vec<Box<dyn Preparer>>,
    retrain_preparer: Option<Box<dyn Preparer>>,
    mode: PreparerMode,
    fold_count: usize,
    seed: u64,
    context: PreparerContext,
}

impl Preparer for CrossTrainedPreparer {
    fn mode(&self) -> PreparerMode {
        self.mode
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        let (group, data_row) = split_group(row);
        let fold = fold_assignment(group, self.fold_count, self.seed);
        for (i, preparer) in self.fold_preparers.iter_mut().enumerate() {
            if i != fold {
                preparer.process(data_row)?;
            }
        }
        if let Some(retrain) = &mut self.retrain_preparer {
            retrain.process(data_row)?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let fold_count = self.fold_count;
        let seed = self.seed;
        let has_retrain = self.retrain_preparer.is_some();

        // One lazy reader per child: fold i admits only rows of other
        // folds, the retrain pass admits everything; all drop the group.
        let mut tasks: Vec<FinishTask> = Vec::with_capacity(fold_count + 1);
        for (i, preparer) in self.fold_preparers.into_iter().enumerate() {
            let fold_reader = reader.map(|r| {
                r.filter(move |row| {
                    fold_assignment(row.last().unwrap_or(&Value::Absent), fold_count, seed) != i
                })
                .drop_last()
            });
            tasks.push(FinishTask {
                label: format!("fold {}", i),
                preparer,
                reader: fold_reader,
            });
        }
        if let Some(preparer) = self.retrain_preparer {
            tasks.push(FinishTask {
                label: "retrain".to_string(),
                preparer,
                reader: reader.map(RowReader::drop_last),
            });
        }

        log::debug!("{}: finishing {} child preparers", self.name, tasks.len());
        let closures: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                move |_: &crate::termination::TerminationFlag| {
                    log::debug!("starting {} finish", task.label);
                    task.preparer
                        .finish(task.reader.as_ref())
                        .map_err(PrepareError::from_inner)
                }
            })
            .collect();

        let mut results = run_all(
            self.context.concurrency().capped_at(fold_count + 1),
            self.context.termination(),
            closures,
        )?;

        let retrained = if has_retrain { results.pop() } else { None };
        // Each fold model scores only rows it never saw, so the new-data
        // variant is the right half of every child result.
        let fold_models: Vec<Arc<dyn PreparedTransformer>> =
            results.into_iter().map(|r| r.for_new_data).collect();

        let dispatch: Arc<dyn PreparedTransformer> = Arc::new(FoldDispatch {
            name: format!("{}/dispatch", self.name),
            fold_models,
            fold_count,
            seed,
        });
        let for_new_data: Arc<dyn PreparedTransformer> = match retrained {
            Some(result) => Arc::new(TrailingInputIgnored {
                name: format!("{}/retrained", self.name),
                inner: result.for_new_data,
            }),
            None => Arc::clone(&dispatch),
        };
        Ok(PreparerResult::new(dispatch, for_new_data))
    }
}

struct FinishTask {
    label: String,
    preparer: Box<dyn Preparer>,
    reader: Option<RowReader>,
}

fn split_group(row: &[Value]) -> (&Value, &[Value]) {
    static ABSENT: Value = Value::Absent;
    match row.split_last() {
        Some((group, rest)) => (group, rest),
        None => (&ABSENT, row),
    }
}

/// Routes each row to the fold model that never saw it, using the
/// still-present trailing group column.
struct FoldDispatch {
    name: String,
    fold_models: Vec<Arc<dyn PreparedTransformer>>,
    fold_count: usize,
    seed: u64,
}

impl PreparedTransformer for FoldDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        let (group, data_row) = split_group(row);
        let fold = fold_assignment(group, self.fold_count, self.seed);
        self.fold_models[fold].apply(None, data_row)
    }
}

/// Accepts (and ignores) the trailing group column so the retrained model
/// preserves the cross-trainer's arity.
struct TrailingInputIgnored {
    name: String,
    inner: Arc<dyn PreparedTransformer>,
}

impl PreparedTransformer for TrailingInputIgnored {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        let (_, data_row) = split_group(row);
        self.inner.apply(cache, data_row)
    }

    fn create_cache(&self) -> Option<Arc<dyn ExecutionCache>> {
        self.inner.create_cache()
    }
}
