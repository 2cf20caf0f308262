//! Lazy, multi-pass row readers.
//!
//! A [`RowReader`] is a cheap-clone handle over a replayable sequence of
//! rows. `filter` and `map` build new readers without materializing
//! anything; evaluation happens per iterator pull. Batch-mode preparers
//! receive a reader at finish and may open any number of concurrent
//! passes over it.

use crate::values::Row;
use std::sync::Arc;

/// Source of rows behind a [`RowReader`]. Implementations must support
/// repeated `open` calls, including concurrent ones.
pub trait RowSource: Send + Sync {
    fn open(&self) -> Box<dyn Iterator<Item = Row> + Send + '_>;

    /// Number of rows, when cheaply known. Lazy combinator chains lose it.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// A lazy, replayable reader of rows.
#[derive(Clone)]
pub struct RowReader {
    source: Arc<dyn RowSource>,
}

impl RowReader {
    pub fn new(source: Arc<dyn RowSource>) -> Self {
        Self { source }
    }

    /// Reader over an in-memory vector of rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::new(Arc::new(VecSource { rows }))
    }

    /// Opens a fresh pass over the data.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        self.source.open()
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.source.size_hint()
    }

    /// Lazily admits only rows satisfying the predicate.
    pub fn filter<P>(&self, predicate: P) -> RowReader
    where
        P: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        RowReader::new(Arc::new(FilterSource {
            inner: Arc::clone(&self.source),
            predicate: Box::new(predicate),
        }))
    }

    /// Lazily rewrites each row.
    pub fn map<F>(&self, transform: F) -> RowReader
    where
        F: Fn(Row) -> Row + Send + Sync + 'static,
    {
        RowReader::new(Arc::new(MapSource {
            inner: Arc::clone(&self.source),
            transform: Box::new(transform),
        }))
    }

    /// Projects each row onto the given input positions, in order.
    pub fn project(&self, positions: &[usize]) -> RowReader {
        let positions = positions.to_vec();
        self.map(move |row| positions.iter().map(|&i| row[i].clone()).collect())
    }

    /// Drops the trailing value of each row.
    pub fn drop_last(&self) -> RowReader {
        self.map(|mut row| {
            row.pop();
            row
        })
    }

    /// Materializes every row of one pass.
    pub fn collect(&self) -> Vec<Row> {
        self.iter().collect()
    }

    /// Counts rows with a full pass.
    pub fn count(&self) -> u64 {
        self.size_hint().unwrap_or_else(|| self.iter().count() as u64)
    }
}

struct VecSource {
    rows: Vec<Row>,
}

impl RowSource for VecSource {
    fn open(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.rows.iter().cloned())
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.rows.len() as u64)
    }
}

struct FilterSource {
    inner: Arc<dyn RowSource>,
    predicate: Box<dyn Fn(&Row) -> bool + Send + Sync>,
}

impl RowSource for FilterSource {
    fn open(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.inner.open().filter(move |row| (self.predicate)(row)))
    }
}

struct MapSource {
    inner: Arc<dyn RowSource>,
    transform: Box<dyn Fn(Row) -> Row + Send + Sync>,
}

impl RowSource for MapSource {
    fn open(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.inner.open().map(move |row| (self.transform)(row)))
    }
}
