//! Toy transformers shared by the integration tests.

#![allow(dead_code)]

use dagprep::data::RowReader;
use dagprep::error::Result;
use dagprep::transform::{
    FnPrepared, PreparableTransformer, Preparer, PreparerContext, PreparerMode, PreparerResult,
};
use dagprep::values::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Learns the distinct training values; the prepared transformer maps a
/// value to its 0-based rank in ascending order (absent for unseen).
pub struct Rank;

impl PreparableTransformer for Rank {
    fn name(&self) -> &str {
        "rank"
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(RankPreparer { seen: Vec::new() }))
    }
}

struct RankPreparer {
    seen: Vec<i64>,
}

impl Preparer for RankPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Stream
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        if let Some(v) = row[0].as_int() {
            if !self.seen.contains(&v) {
                self.seen.push(v);
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>, _reader: Option<&RowReader>) -> Result<PreparerResult> {
        let mut sorted = self.seen;
        sorted.sort_unstable();
        Ok(PreparerResult::of_both(Arc::new(FnPrepared::new(
            "rank-of",
            move |row: &[Value]| match row[0].as_int() {
                Some(v) => match sorted.binary_search(&v) {
                    Ok(rank) => Value::Int(rank as i64),
                    Err(_) => Value::Absent,
                },
                None => Value::Absent,
            },
        ))))
    }
}

/// Counts occurrences of each training value; the prepared transformer
/// reports how many times its input value was seen.
pub struct Multiplicity;

impl PreparableTransformer for Multiplicity {
    fn name(&self) -> &str {
        "multiplicity"
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(MultiplicityPreparer { counts: Vec::new() }))
    }
}

struct MultiplicityPreparer {
    counts: Vec<(Value, i64)>,
}

impl Preparer for MultiplicityPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Stream
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        match self.counts.iter_mut().find(|(v, _)| *v == row[0]) {
            Some((_, n)) => *n += 1,
            None => self.counts.push((row[0].clone(), 1)),
        }
        Ok(())
    }

    fn finish(self: Box<Self>, _reader: Option<&RowReader>) -> Result<PreparerResult> {
        let counts = self.counts;
        Ok(PreparerResult::of_both(Arc::new(FnPrepared::new(
            "count-of",
            move |row: &[Value]| {
                Value::Int(
                    counts
                        .iter()
                        .find(|(v, _)| *v == row[0])
                        .map(|(_, n)| *n)
                        .unwrap_or(0),
                )
            },
        ))))
    }
}

/// Records every training value; the prepared transformer answers 1 if a
/// value was seen during training and 0 otherwise. The shared counter
/// tallies process calls across every preparer instance.
pub struct TrainedIndicator {
    pub processed: Arc<AtomicUsize>,
}

impl TrainedIndicator {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl PreparableTransformer for TrainedIndicator {
    fn name(&self) -> &str {
        "trained-indicator"
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(TrainedIndicatorPreparer {
            seen: Vec::new(),
            processed: Arc::clone(&self.processed),
        }))
    }
}

struct TrainedIndicatorPreparer {
    seen: Vec<Value>,
    processed: Arc<AtomicUsize>,
}

impl Preparer for TrainedIndicatorPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Stream
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !self.seen.contains(&row[0]) {
            self.seen.push(row[0].clone());
        }
        Ok(())
    }

    fn finish(self: Box<Self>, _reader: Option<&RowReader>) -> Result<PreparerResult> {
        let seen = self.seen;
        Ok(PreparerResult::of_both(Arc::new(FnPrepared::new(
            "seen-indicator",
            move |row: &[Value]| Value::Int(i64::from(seen.contains(&row[0]))),
        ))))
    }
}

/// Batch-mode preparable: ignores the streaming pass and counts its rows
/// from the replayable reader at finish; the prepared transformer returns
/// that count for any input.
pub struct BatchRowCount;

impl PreparableTransformer for BatchRowCount {
    fn name(&self) -> &str {
        "batch-row-count"
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(BatchRowCountPreparer))
    }
}

struct BatchRowCountPreparer;

impl Preparer for BatchRowCountPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Batch
    }

    fn process(&mut self, _row: &[Value]) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let count = reader.map_or(0, |r| r.count()) as i64;
        Ok(PreparerResult::of_both(Arc::new(FnPrepared::new(
            "row-count",
            move |_: &[Value]| Value::Int(count),
        ))))
    }
}

/// A preparable whose trained behavior is a fixed function of the row;
/// training is a no-op. Used as best-model candidates.
pub struct StatelessCandidate {
    name: String,
    function: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl StatelessCandidate {
    pub fn new(
        name: impl Into<String>,
        function: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }
}

impl PreparableTransformer for StatelessCandidate {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(StatelessPreparer {
            name: self.name.clone(),
            function: Arc::clone(&self.function),
        }))
    }
}

struct StatelessPreparer {
    name: String,
    function: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl Preparer for StatelessPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Stream
    }

    fn process(&mut self, _row: &[Value]) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>, _reader: Option<&RowReader>) -> Result<PreparerResult> {
        let function = self.function;
        Ok(PreparerResult::of_both(Arc::new(FnPrepared::new(
            self.name,
            move |row: &[Value]| function(row),
        ))))
    }
}

/// Evaluator over (predicted, actual) rows: the finalized constant output
/// is the fraction of matching pairs.
pub struct AccuracyEvaluator;

impl PreparableTransformer for AccuracyEvaluator {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn has_constant_result(&self) -> bool {
        true
    }

    fn preparer(&self, _: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(AccuracyPreparer {
            matches: 0,
            total: 0,
        }))
    }
}

struct AccuracyPreparer {
    matches: u64,
    total: u64,
}

impl Preparer for AccuracyPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Stream
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        self.total += 1;
        if row[0] == row[1] {
            self.matches += 1;
        }
        Ok(())
    }

    fn finish(self: Box<Self>, _reader: Option<&RowReader>) -> Result<PreparerResult> {
        let accuracy = if self.total == 0 {
            0.0
        } else {
            self.matches as f64 / self.total as f64
        };
        Ok(PreparerResult::of_both(Arc::new(
            FnPrepared::new("accuracy-value", move |_: &[Value]| Value::Float(accuracy))
                .with_constant_result(),
        )))
    }
}
