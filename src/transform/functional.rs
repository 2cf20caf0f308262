//! Closure-backed prepared transformers.
//!
//! Most leaf logic in tests and evaluator factories is a plain function of
//! the row; `FnPrepared` wraps one without a bespoke type.

use super::{ExecutionCache, PreparedTransformer};
use crate::values::Value;
use std::sync::Arc;

/// A prepared transformer backed by a closure.
#[derive(Clone)]
pub struct FnPrepared {
    name: Arc<str>,
    arity: Option<usize>,
    constant_result: bool,
    function: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl FnPrepared {
    pub fn new(
        name: impl Into<Arc<str>>,
        function: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            arity: None,
            constant_result: false,
            function: Arc::new(function),
        }
    }

    /// Copy with a fixed arity enforced at DAG validation.
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Copy flagged constant-result: the closure ignores its row and the
    /// graph reducer may fold this node to a single value.
    pub fn with_constant_result(mut self) -> Self {
        self.constant_result = true;
        self
    }
}

impl PreparedTransformer for FnPrepared {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        (self.function)(row)
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }

    fn has_constant_result(&self) -> bool {
        self.constant_result
    }
}
