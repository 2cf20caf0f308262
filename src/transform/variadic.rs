//! Dynamic-arity adapter.
//!
//! Transformers may be authored over a single array-valued input and
//! lifted to N positional inputs: each apply packs the N values into one
//! `Value::List` before delegating. The preparable variant packs rows the
//! same way on the streaming path and rewrites the reader for the batch
//! path, then lifts both finished prepared transformers.

use super::{
    ExecutionCache, PreparableTransformer, PreparedTransformer, Preparer, PreparerContext,
    PreparerMode, PreparerResult,
};
use crate::data::RowReader;
use crate::error::Result;
use crate::values::Value;
use std::sync::Arc;

fn pack(row: &[Value]) -> Vec<Value> {
    vec![Value::list(row.to_vec())]
}

/// Lifts an array-input prepared transformer to N positional inputs.
pub struct VariadicPrepared {
    inner: Arc<dyn PreparedTransformer>,
    arity: usize,
}

impl VariadicPrepared {
    pub fn new(inner: Arc<dyn PreparedTransformer>, arity: usize) -> Self {
        Self { inner, arity }
    }
}

impl PreparedTransformer for VariadicPrepared {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn apply(&self, cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        self.inner.apply(cache, &pack(row))
    }

    fn arity(&self) -> Option<usize> {
        Some(self.arity)
    }

    fn create_cache(&self) -> Option<Arc<dyn ExecutionCache>> {
        self.inner.create_cache()
    }

    fn preferred_minibatch_size(&self) -> usize {
        self.inner.preferred_minibatch_size()
    }

    fn has_constant_result(&self) -> bool {
        self.inner.has_constant_result()
    }
}

/// Lifts an array-input preparable transformer to N positional inputs.
pub struct VariadicPreparable {
    inner: Arc<dyn PreparableTransformer>,
    arity: usize,
}

impl VariadicPreparable {
    pub fn new(inner: Arc<dyn PreparableTransformer>, arity: usize) -> Self {
        Self { inner, arity }
    }
}

impl PreparableTransformer for VariadicPreparable {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(VariadicPreparer {
            inner: self.inner.preparer(context)?,
            arity: self.arity,
        }))
    }

    fn arity(&self) -> Option<usize> {
        Some(self.arity)
    }

    fn is_idempotent(&self) -> bool {
        self.inner.is_idempotent()
    }

    fn has_constant_result(&self) -> bool {
        self.inner.has_constant_result()
    }
}

struct VariadicPreparer {
    inner: Box<dyn Preparer>,
    arity: usize,
}

impl Preparer for VariadicPreparer {
    fn mode(&self) -> PreparerMode {
        self.inner.mode()
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        self.inner.process(&pack(row))
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let packed = reader.map(|r| r.map(|row| pack(&row)));
        let result = self.inner.finish(packed.as_ref())?;
        Ok(PreparerResult::new(
            Arc::new(VariadicPrepared::new(result.for_preparation_data, self.arity)),
            Arc::new(VariadicPrepared::new(result.for_new_data, self.arity)),
        ))
    }
}
