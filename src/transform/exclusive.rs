//! Exclusive-lock adapter for mutably stateful models.
//!
//! Some trained back-ends (a computation graph, an embedded interpreter)
//! mutate internal state on every inference call and are not safe for the
//! concurrent applies the executor is allowed to issue. `ExclusiveApply`
//! adapts such a model to the [`PreparedTransformer`] contract by
//! serializing applies under an exclusive lock.

use super::{ExecutionCache, PreparedTransformer};
use crate::values::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// A model whose apply requires exclusive access.
pub trait MutApply: Send + 'static {
    fn name(&self) -> &str;

    fn apply_mut(&mut self, row: &[Value]) -> Value;

    fn arity(&self) -> Option<usize> {
        None
    }
}

/// Serializes apply calls to a [`MutApply`] model under a lock.
pub struct ExclusiveApply {
    name: String,
    arity: Option<usize>,
    inner: Mutex<Box<dyn MutApply>>,
}

impl ExclusiveApply {
    pub fn new(model: impl MutApply) -> Self {
        Self {
            name: model.name().to_string(),
            arity: model.arity(),
            inner: Mutex::new(Box::new(model)),
        }
    }

    pub fn shared(model: impl MutApply) -> Arc<dyn PreparedTransformer> {
        Arc::new(Self::new(model))
    }
}

impl PreparedTransformer for ExclusiveApply {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }

    fn apply(&self, _cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        self.inner.lock().apply_mut(row)
    }
}
