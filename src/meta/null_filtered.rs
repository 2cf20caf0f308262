//! Null-filtered preparation and application.
//!
//! Wraps a preparable or prepared transformer with two orthogonal
//! policies, both on by default:
//!
//! - *Filtered preparation*: rows containing any absent input are never
//!   forwarded to the wrapped preparer and do not influence the model.
//! - *Filtered application*: rows containing any absent input are never
//!   evaluated by the wrapped prepared transformer; a configured fallback
//!   value (default: absent) is returned instead.

use crate::data::RowReader;
use crate::error::Result;
use crate::transform::{
    ExecutionCache, PreparableTransformer, PreparedTransformer, Preparer, PreparerContext,
    PreparerMode, PreparerResult,
};
use crate::values::Value;
use std::sync::Arc;

fn complete(row: &[Value]) -> bool {
    row.iter().all(|value| !value.is_absent())
}

/// Null-filtered wrapper around a preparable transformer.
pub struct NullFiltered {
    wrapped: Arc<dyn PreparableTransformer>,
    filtered_preparation: bool,
    filtered_application: bool,
    fallback: Value,
    name: String,
}

impl NullFiltered {
    pub fn new(wrapped: Arc<dyn PreparableTransformer>) -> Self {
        let name = format!("null-filtered({})", wrapped.name());
        Self {
            wrapped,
            filtered_preparation: true,
            filtered_application: true,
            fallback: Value::Absent,
            name,
        }
    }

    /// Copy with filtered preparation toggled.
    pub fn with_filtered_preparation(mut self, enabled: bool) -> Self {
        self.filtered_preparation = enabled;
        self
    }

    /// Copy with filtered application toggled.
    pub fn with_filtered_application(mut self, enabled: bool) -> Self {
        self.filtered_application = enabled;
        self
    }

    /// Copy with the value returned when application is skipped.
    pub fn with_fallback_value(mut self, fallback: Value) -> Self {
        self.fallback = fallback;
        self
    }
}

impl PreparableTransformer for NullFiltered {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.wrapped.arity()
    }

    fn is_idempotent(&self) -> bool {
        self.wrapped.is_idempotent()
    }

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(NullFilteredPreparer {
            inner: self.wrapped.preparer(context)?,
            filtered_preparation: self.filtered_preparation,
            filtered_application: self.filtered_application,
            fallback: self.fallback.clone(),
        }))
    }
}

struct NullFilteredPreparer {
    inner: Box<dyn Preparer>,
    filtered_preparation: bool,
    filtered_application: bool,
    fallback: Value,
}

impl Preparer for NullFilteredPreparer {
    fn mode(&self) -> PreparerMode {
        self.inner.mode()
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        if self.filtered_preparation && !complete(row) {
            return Ok(());
        }
        self.inner.process(row)
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let filtered;
        let forwarded = match reader {
            Some(reader) if self.filtered_preparation => {
                filtered = reader.filter(|row| complete(row));
                Some(&filtered)
            }
            other => other,
        };
        let result = self.inner.finish(forwarded)?;
        if !self.filtered_application {
            return Ok(result);
        }
        Ok(PreparerResult::new(
            Arc::new(NullFilteredPrepared::with_fallback(
                result.for_preparation_data,
                self.fallback.clone(),
            )),
            Arc::new(NullFilteredPrepared::with_fallback(
                result.for_new_data,
                self.fallback,
            )),
        ))
    }
}

/// Null-filtered application around an already-prepared transformer.
pub struct NullFilteredPrepared {
    wrapped: Arc<dyn PreparedTransformer>,
    fallback: Value,
    name: String,
}

impl NullFilteredPrepared {
    pub fn new(wrapped: Arc<dyn PreparedTransformer>) -> Self {
        Self::with_fallback(wrapped, Value::Absent)
    }

    pub fn with_fallback(wrapped: Arc<dyn PreparedTransformer>, fallback: Value) -> Self {
        let name = format!("null-filtered({})", wrapped.name());
        Self {
            wrapped,
            fallback,
            name,
        }
    }
}

impl PreparedTransformer for NullFilteredPrepared {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.wrapped.arity()
    }

    fn apply(&self, cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        if complete(row) {
            self.wrapped.apply(cache, row)
        } else {
            self.fallback.clone()
        }
    }

    fn create_cache(&self) -> Option<Arc<dyn ExecutionCache>> {
        self.wrapped.create_cache()
    }

    fn preferred_minibatch_size(&self) -> usize {
        self.wrapped.preferred_minibatch_size()
    }

    fn absent_input_short_circuit(&self) -> Option<Value> {
        Some(self.fallback.clone())
    }

    /// Partitions the minibatch: complete rows go through the wrapped
    /// transformer in a re-packed column layout, fallback values are
    /// spliced back at the positions of incomplete rows.
    fn apply_minibatch(
        &self,
        cache: Option<&dyn ExecutionCache>,
        columns: &[Vec<Value>],
        results: &mut Vec<Value>,
    ) {
        let rows = columns.first().map_or(0, Vec::len);
        let admitted: Vec<usize> = (0..rows)
            .filter(|&r| columns.iter().all(|col| !col[r].is_absent()))
            .collect();

        if admitted.len() == rows {
            self.wrapped.apply_minibatch(cache, columns, results);
            return;
        }

        let packed: Vec<Vec<Value>> = columns
            .iter()
            .map(|col| admitted.iter().map(|&r| col[r].clone()).collect())
            .collect();
        let mut packed_results = Vec::with_capacity(admitted.len());
        self.wrapped
            .apply_minibatch(cache, &packed, &mut packed_results);

        let mut next = 0usize;
        for r in 0..rows {
            if next < admitted.len() && admitted[next] == r {
                results.push(packed_results[next].clone());
                next += 1;
            } else {
                results.push(self.fallback.clone());
            }
        }
    }
}
