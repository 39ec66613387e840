//! Uniform constructors for job enumerators.

use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::Arc;

use super::csv::CsvSource;
use super::nested::{LevelBuilder, NestedEnumerator};
use super::tabular::{
    BatchEnumerator, KeysetPager, QueryExecutor, RecordEnumerator, Relation,
    RelationBatchEnumerator, TableRow, TabularOptions,
};
use super::{ArrayEnumerator, BoxEnumerator, RangeEnumerator};
use crate::cursor::Cursor;
use crate::error::{ErrorCode, IterationError, Result};

/// Builds boxed enumerators from a resume cursor.
///
/// ```rust,ignore
/// async fn build_enumerator(&self, ctx: &IterationContext<'_>, cursor: Option<Cursor>)
///     -> Result<Option<BoxEnumerator<Vec<TableRow>>>>
/// {
///     let relation = Relation::new("products").filter(Predicate::eq("discontinued", false));
///     self.builder
///         .batches(relation, TabularOptions::new().batch_size(500), cursor)
///         .map(Some)
/// }
/// ```
#[derive(Clone, Default)]
pub struct EnumeratorBuilder {
    executor: Option<Arc<dyn QueryExecutor>>,
}

impl EnumeratorBuilder {
    /// A builder without tabular support.
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder whose tabular enumerators query through `executor`.
    pub fn with_executor(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor: Some(executor),
        }
    }

    fn executor(&self) -> Result<Arc<dyn QueryExecutor>> {
        self.executor.clone().ok_or_else(|| {
            IterationError::configuration(
                ErrorCode::InvalidConfiguration,
                "tabular enumerators need a builder created with a query executor",
            )
        })
    }

    fn pager(&self, relation: Relation, options: TabularOptions, cursor: Option<Cursor>) -> Result<KeysetPager> {
        KeysetPager::new(self.executor()?, relation, options, cursor)
    }

    /// A single step, for jobs that only need interruption handling around one unit of work.
    pub fn once(&self, cursor: Option<Cursor>) -> Result<BoxEnumerator<u64>> {
        self.times(1, cursor)
    }

    /// Steps `0..count`.
    pub fn times(&self, count: u64, cursor: Option<Cursor>) -> Result<BoxEnumerator<u64>> {
        Ok(Box::new(RangeEnumerator::new(count, cursor)?))
    }

    pub fn array<T: Send + 'static>(&self, items: Vec<T>, cursor: Option<Cursor>) -> Result<BoxEnumerator<T>> {
        Ok(Box::new(ArrayEnumerator::new(items, cursor)?))
    }

    /// One row at a time.
    pub fn records(
        &self,
        relation: Relation,
        options: TabularOptions,
        cursor: Option<Cursor>,
    ) -> Result<BoxEnumerator<TableRow>> {
        Ok(Box::new(RecordEnumerator::new(self.pager(relation, options, cursor)?)))
    }

    /// Loaded batches of rows.
    pub fn batches(
        &self,
        relation: Relation,
        options: TabularOptions,
        cursor: Option<Cursor>,
    ) -> Result<BoxEnumerator<Vec<TableRow>>> {
        Ok(Box::new(BatchEnumerator::new(self.pager(relation, options, cursor)?)))
    }

    /// Relations narrowed to each batch's primary keys, for bulk statements.
    pub fn batch_relations(
        &self,
        relation: Relation,
        options: TabularOptions,
        cursor: Option<Cursor>,
    ) -> Result<BoxEnumerator<Relation>> {
        Ok(Box::new(RelationBatchEnumerator::new(
            self.pager(relation, options, cursor)?,
        )))
    }

    pub fn csv_rows<R, T>(&self, source: CsvSource<R>, cursor: Option<Cursor>) -> Result<BoxEnumerator<T>>
    where
        R: Read + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        Ok(Box::new(source.rows::<T>(cursor)?))
    }

    pub fn csv_batches<R, T>(
        &self,
        source: CsvSource<R>,
        batch_size: usize,
        cursor: Option<Cursor>,
    ) -> Result<BoxEnumerator<Vec<T>>>
    where
        R: Read + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        Ok(Box::new(source.batches::<T>(batch_size, cursor)?))
    }

    pub fn nested<T: Send + 'static>(
        &self,
        levels: Vec<LevelBuilder<T>>,
        cursor: Option<Cursor>,
    ) -> Result<BoxEnumerator<T>> {
        Ok(Box::new(NestedEnumerator::new(levels, cursor)?))
    }
}
