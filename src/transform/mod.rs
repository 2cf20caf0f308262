//! Transformer and preparer contracts.
//!
//! Every DAG transformer is one of two variants. A *prepared* transformer
//! is a pure function from a row of parent values to one output value. A
//! *preparable* transformer is a factory that, when training begins,
//! yields a [`Preparer`]: a stateful accumulator that consumes the
//! preparation rows and finishes into a pair of prepared transformers: one
//! scoring preparation data for downstream nodes during the same training
//! pass, one retained in the finalized DAG for new data.

mod context;
mod exclusive;
mod functional;
mod variadic;

pub use context::{PreparerContext, SubDagExecutor};
pub use exclusive::{ExclusiveApply, MutApply};
pub use functional::FnPrepared;
pub use variadic::{VariadicPreparable, VariadicPrepared};

use crate::data::RowReader;
use crate::error::Result;
use crate::values::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Per-execution scratch object for a prepared transformer.
///
/// Created when the executor begins a batch and threaded through apply
/// calls. Must be safe for concurrent applies, and must not be relied on
/// for correctness; the executor may recreate it any number of times per
/// execution. `close` is best-effort.
pub trait ExecutionCache: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn close(&self) {}
}

/// A trained (or inherently stateless) transformer: row in, value out.
pub trait PreparedTransformer: Send + Sync + 'static {
    /// Display name used in logs and errors.
    fn name(&self) -> &str;

    fn apply(&self, cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value;

    /// Expected input count, when fixed. `None` accepts any arity.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Creates the per-execution cache object, if this transformer uses one.
    fn create_cache(&self) -> Option<Arc<dyn ExecutionCache>> {
        None
    }

    /// Bulk apply over a column-major minibatch: `columns[input][row]`.
    /// `results` receives one value per row, in order. The default applies
    /// row by row; implementations may vectorize.
    fn apply_minibatch(
        &self,
        cache: Option<&dyn ExecutionCache>,
        columns: &[Vec<Value>],
        results: &mut Vec<Value>,
    ) {
        let rows = columns.first().map_or(0, Vec::len);
        let mut row = Vec::with_capacity(columns.len());
        for r in 0..rows {
            row.clear();
            row.extend(columns.iter().map(|col| col[r].clone()));
            results.push(self.apply(cache, &row));
        }
    }

    /// Minibatch size hint; executors may ignore it.
    fn preferred_minibatch_size(&self) -> usize {
        1
    }

    /// Whether the output is independent of the inputs. Constant-result
    /// transformers may be folded to a single value by graph reduction.
    fn has_constant_result(&self) -> bool {
        false
    }

    /// When an input is statically known to be absent, the value graph
    /// reduction may substitute for this whole node. Implemented by the
    /// null-filtered wrapper; `None` means no short-circuit.
    fn absent_input_short_circuit(&self) -> Option<Value> {
        None
    }

    /// Concrete-type access for transformer views that must reach into a
    /// prepared meta-transformer's state (e.g. a group table). `None` for
    /// transformers with no viewable state.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// How a preparer consumes the preparation data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreparerMode {
    /// One forward pass; rows may be discarded as processed. `finish`
    /// receives no reader.
    Stream,
    /// `finish` receives a replayable reader over all rows and may iterate
    /// any number of times.
    Batch,
}

/// The pair of prepared transformers a preparer produces.
#[derive(Clone)]
pub struct PreparerResult {
    /// Scores preparation data for downstream nodes during the same
    /// training pass.
    pub for_preparation_data: Arc<dyn PreparedTransformer>,
    /// Retained in the finalized DAG, scores new data.
    pub for_new_data: Arc<dyn PreparedTransformer>,
}

impl PreparerResult {
    pub fn new(
        for_preparation_data: Arc<dyn PreparedTransformer>,
        for_new_data: Arc<dyn PreparedTransformer>,
    ) -> Self {
        Self {
            for_preparation_data,
            for_new_data,
        }
    }

    /// Both roles served by the same prepared transformer.
    pub fn of_both(prepared: Arc<dyn PreparedTransformer>) -> Self {
        Self {
            for_preparation_data: Arc::clone(&prepared),
            for_new_data: prepared,
        }
    }
}

impl fmt::Debug for PreparerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparerResult")
            .field("for_preparation_data", &self.for_preparation_data.name())
            .field("for_new_data", &self.for_new_data.name())
            .finish()
    }
}

/// Stateful trainer created per preparation invocation.
pub trait Preparer: Send {
    fn mode(&self) -> PreparerMode;

    /// Accepts one example row.
    fn process(&mut self, row: &[Value]) -> Result<()>;

    /// Produces the pair of prepared transformers. `reader` is `Some` iff
    /// the mode is [`PreparerMode::Batch`]. On error, partial state is
    /// simply dropped with the preparer.
    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult>;
}

/// A trainable transformer: yields a fresh [`Preparer`] per preparation.
pub trait PreparableTransformer: Send + Sync + 'static {
    /// Display name used in logs and errors.
    fn name(&self) -> &str;

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>>;

    /// Expected input count, when fixed. `None` accepts any arity.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Whether duplicate rows leave the trained result unchanged (order
    /// may still matter).
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Whether both prepared outputs are guaranteed constant-result. The
    /// best-model selector requires this of its evaluator.
    fn has_constant_result(&self) -> bool {
        false
    }
}

/// Newtype carried inside a [`crate::values::Handle`] when a prepared
/// transformer travels through the DAG as a value (auxiliary views).
pub struct ModelHandle(pub Arc<dyn PreparedTransformer>);

impl ModelHandle {
    pub fn into_value(name: &str, prepared: Arc<dyn PreparedTransformer>) -> Value {
        Value::Handle(crate::values::Handle::new(
            name.to_string(),
            Arc::new(ModelHandle(prepared)),
        ))
    }

    /// Recovers the prepared transformer from a view-produced value.
    pub fn from_value(value: &Value) -> Option<Arc<dyn PreparedTransformer>> {
        match value {
            Value::Handle(h) => h.downcast::<ModelHandle>().map(|m| Arc::clone(&m.0)),
            _ => None,
        }
    }
}
