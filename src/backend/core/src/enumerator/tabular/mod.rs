//! Tabular sources paginated with keyset (seek) predicates.
//!
//! This module provides:
//! - **KeysetPager**: fetches ordered batches after a cursor position
//! - **RecordEnumerator**: yields one row at a time, each with its own cursor
//! - **BatchEnumerator**: yields loaded batches of rows
//! - **RelationBatchEnumerator**: yields relations narrowed to each batch's primary keys
//!
//! The pager never uses offsets. After cursor `(c1, .., cn)` the next batch is selected with
//! `(k1, .., kn) > (c1, .., cn)` expanded column by column. The first fetch after a resume
//! compares the last column inclusively so the row at the cursor is seen again; rows whose
//! key equals the cursor are then dropped, which keeps resumption exactly-once.
//!
//! The cursor of a batch is the key of its last row, the position the next fetch resumes
//! from.

pub mod executor;
pub mod postgres;
pub mod relation;

pub use executor::{InMemoryTable, QueryExecutor};
pub use postgres::PgExecutor;
pub use relation::{
    keyset_predicate, Comparison, Predicate, Relation, SortDirection, SortField, TableRow,
};

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

use super::Enumerator;
use crate::cursor::{Cursor, CursorValue};
use crate::error::{ErrorCode, IterationError, Result};

/// Batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordering and batching options for tabular sources.
#[derive(Debug, Clone)]
pub struct TabularOptions {
    columns: Vec<SortField>,
    direction: SortDirection,
    batch_size: usize,
}

impl Default for TabularOptions {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            direction: SortDirection::Asc,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl TabularOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordering columns, all in the configured direction.
    ///
    /// Defaults to the relation's primary key.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns
            .into_iter()
            .map(|c| SortField::new(c, self.direction))
            .collect();
        self
    }

    /// Ordering columns with per-column directions.
    pub fn sort_fields(mut self, fields: Vec<SortField>) -> Self {
        self.columns = fields;
        self
    }

    /// Direction applied to every column set through [`TabularOptions::columns`] and to the
    /// default primary-key ordering.
    pub fn order(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        for field in &mut self.columns {
            field.direction = direction;
        }
        self
    }

    /// Like [`TabularOptions::order`], parsing `"asc"` / `"desc"`.
    pub fn order_str(self, direction: &str) -> Result<Self> {
        Ok(self.order(direction.parse()?))
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Keyset Pager
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetches successive ordered batches of a relation.
pub struct KeysetPager {
    executor: Arc<dyn QueryExecutor>,
    relation: Relation,
    fields: Vec<SortField>,
    columns: Vec<String>,
    batch_size: usize,
    position: Option<Vec<CursorValue>>,
    resumed: bool,
    batches_fetched: u64,
    exhausted: bool,
}

impl std::fmt::Debug for KeysetPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetPager")
            .field("table", &self.relation.table_name())
            .field("fields", &self.fields)
            .field("batch_size", &self.batch_size)
            .field("position", &self.position)
            .field("batches_fetched", &self.batches_fetched)
            .finish()
    }
}

impl KeysetPager {
    /// Validate the configuration and position the pager after `cursor`.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        relation: Relation,
        options: TabularOptions,
        cursor: Option<Cursor>,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(IterationError::configuration(
                ErrorCode::InvalidBatchSize,
                "batch_size must be at least 1",
            ));
        }
        if !relation.ordering().is_empty() {
            return Err(IterationError::configuration(
                ErrorCode::ConflictingOrderClause,
                "the relation must not have an order clause; the enumerator orders by its columns",
            ));
        }
        if relation.row_limit().is_some() {
            return Err(IterationError::configuration(
                ErrorCode::ConflictingLimitClause,
                "the relation must not have a limit clause; the enumerator limits by batch_size",
            ));
        }

        let primary_key = relation.primary_key_columns();
        let mut fields: Vec<SortField> = if options.columns.is_empty() {
            if primary_key.is_empty() {
                return Err(IterationError::configuration(
                    ErrorCode::MissingOrderingKey,
                    format!(
                        "no columns given and table {:?} has no primary key to order by",
                        relation.table_name()
                    ),
                ));
            }
            primary_key
                .iter()
                .map(|c| SortField::new(c.clone(), options.direction))
                .collect()
        } else {
            options.columns
        };

        let mut seen = HashSet::new();
        if let Some(duplicate) = fields.iter().find(|f| !seen.insert(f.name.as_str())) {
            return Err(IterationError::configuration(
                ErrorCode::InvalidConfiguration,
                format!("column {:?} appears more than once in the ordering key", duplicate.name),
            ));
        }

        let missing: Vec<&String> = primary_key
            .iter()
            .filter(|pk| !fields.iter().any(|f| &f.name == *pk))
            .collect();
        match missing.as_slice() {
            [] => {}
            // A single-column key is appended as the final tie-breaker.
            [pk] if primary_key.len() == 1 => {
                let direction = fields.last().map(|f| f.direction).unwrap_or(options.direction);
                fields.push(SortField::new((*pk).clone(), direction));
            }
            _ => {
                return Err(IterationError::configuration(
                    ErrorCode::PrimaryKeyNotCovered,
                    format!(
                        "columns must include every component of the composite primary key {:?}; missing {:?}",
                        primary_key, missing
                    ),
                ));
            }
        }
        let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();

        let position = match cursor.filter(|c| !c.is_null()) {
            Some(cursor) => Some(cursor.into_tuple(columns.len())?),
            None => None,
        };

        Ok(Self {
            executor,
            resumed: position.is_some(),
            relation,
            fields,
            columns,
            batch_size: options.batch_size,
            position,
            batches_fetched: 0,
            exhausted: false,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Number of batches fetched by this pager.
    pub fn batches_fetched(&self) -> u64 {
        self.batches_fetched
    }

    /// The cursor of the last row fetched, or the resume cursor before any fetch.
    pub fn position(&self) -> Option<Cursor> {
        self.position.clone().map(Cursor::from_tuple)
    }

    fn first_fetch_after_resume(&self) -> bool {
        self.resumed && self.batches_fetched == 0
    }

    /// The relation selecting the next batch, projected to at least `required` columns.
    pub fn next_batch_relation(&self, required: &[String]) -> Relation {
        let inclusive = self.first_fetch_after_resume();
        let mut relation = self.relation.clone();

        if let Some(position) = &self.position {
            relation = relation.filter(keyset_predicate(&self.fields, position, inclusive));
        }
        for field in &self.fields {
            relation = relation.order_by(field.clone());
        }

        let limit = if inclusive {
            self.batch_size + 1
        } else {
            self.batch_size
        };
        relation = relation.limit(limit as u64);

        if let Some(projection) = self.relation.projection() {
            let mut columns = projection.to_vec();
            for column in self.columns.iter().chain(required) {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
            relation = relation.select(columns);
        }
        relation
    }

    /// Fetch the next batch of at most `batch_size` rows; empty once exhausted.
    pub async fn fetch_next(&mut self) -> Result<Vec<TableRow>> {
        self.fetch_with(&[]).await
    }

    /// Like [`KeysetPager::fetch_next`], guaranteeing `required` columns are selected.
    pub async fn fetch_with(&mut self, required: &[String]) -> Result<Vec<TableRow>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let inclusive = self.first_fetch_after_resume();
        let query = self.next_batch_relation(required);
        let limit = query.row_limit().unwrap_or(self.batch_size as u64) as usize;

        let mut rows = self.executor.fetch(&query).await?;
        let fetched = rows.len();
        self.batches_fetched += 1;

        if inclusive {
            if let Some(position) = &self.position {
                let columns = &self.columns;
                rows.retain(|row| {
                    row.key(columns)
                        .map(|key| !relation::tuple_eq(&key, position))
                        .unwrap_or(true)
                });
            }
        }
        rows.truncate(self.batch_size);

        if fetched < limit {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.position = Some(last.key(&self.columns)?);
        }

        trace!(
            table = %self.relation.table_name(),
            batch = self.batches_fetched,
            rows = rows.len(),
            inclusive,
            "Fetched keyset batch"
        );
        Ok(rows)
    }

    /// Estimated number of rows admitted by the relation.
    pub async fn count(&self) -> Result<u64> {
        self.executor.count(&self.relation).await
    }

    fn batch_count(&self, rows: u64) -> u64 {
        rows.div_ceil(self.batch_size as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enumerators
// ═══════════════════════════════════════════════════════════════════════════════

/// Yields each row with its own cursor.
#[derive(Debug)]
pub struct RecordEnumerator {
    pager: KeysetPager,
    buffer: VecDeque<TableRow>,
}

impl RecordEnumerator {
    pub fn new(pager: KeysetPager) -> Self {
        Self {
            pager,
            buffer: VecDeque::new(),
        }
    }
}

#[async_trait]
impl Enumerator for RecordEnumerator {
    type Item = TableRow;

    async fn next(&mut self) -> Result<Option<(TableRow, Cursor)>> {
        if self.buffer.is_empty() {
            self.buffer.extend(self.pager.fetch_next().await?);
        }
        match self.buffer.pop_front() {
            Some(row) => {
                let cursor = Cursor::from_tuple(row.key(self.pager.columns())?);
                Ok(Some((row, cursor)))
            }
            None => Ok(None),
        }
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.pager.count().await?))
    }
}

/// Yields loaded batches of rows, each with the cursor of its last row.
#[derive(Debug)]
pub struct BatchEnumerator {
    pager: KeysetPager,
}

impl BatchEnumerator {
    pub fn new(pager: KeysetPager) -> Self {
        Self { pager }
    }
}

#[async_trait]
impl Enumerator for BatchEnumerator {
    type Item = Vec<TableRow>;

    async fn next(&mut self) -> Result<Option<(Vec<TableRow>, Cursor)>> {
        let rows = self.pager.fetch_next().await?;
        match rows.last() {
            Some(last) => {
                let cursor = Cursor::from_tuple(last.key(self.pager.columns())?);
                Ok(Some((rows, cursor)))
            }
            None => Ok(None),
        }
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        let rows = self.pager.count().await?;
        Ok(Some(self.pager.batch_count(rows)))
    }
}

/// Yields, per batch, the source relation narrowed to the batch's primary keys.
///
/// Only key columns are loaded.
#[derive(Debug)]
pub struct RelationBatchEnumerator {
    pager: KeysetPager,
    key_columns: Vec<String>,
}

impl RelationBatchEnumerator {
    pub fn new(pager: KeysetPager) -> Self {
        let mut key_columns = pager.columns().to_vec();
        for pk in pager.relation().primary_key_columns() {
            if !key_columns.contains(pk) {
                key_columns.push(pk.clone());
            }
        }
        Self { pager, key_columns }
    }
}

#[async_trait]
impl Enumerator for RelationBatchEnumerator {
    type Item = Relation;

    async fn next(&mut self) -> Result<Option<(Relation, Cursor)>> {
        let primary_key = self.pager.relation().primary_key_columns().to_vec();
        let rows = self.pager.fetch_keys(&self.key_columns).await?;
        let Some(last) = rows.last() else {
            return Ok(None);
        };

        let cursor = Cursor::from_tuple(last.key(self.pager.columns())?);
        let keys = rows
            .iter()
            .map(|row| row.key(&primary_key))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((self.pager.relation().constrained_to(keys), cursor)))
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        let rows = self.pager.count().await?;
        Ok(Some(self.pager.batch_count(rows)))
    }
}

impl KeysetPager {
    /// Fetch the next batch selecting only `key_columns`.
    async fn fetch_keys(&mut self, key_columns: &[String]) -> Result<Vec<TableRow>> {
        if self.relation.projection().is_some() {
            return self.fetch_with(key_columns).await;
        }
        let original = self.relation.clone();
        self.relation = original.clone().select(key_columns.to_vec());
        let result = self.fetch_with(key_columns).await;
        self.relation = original;
        result
    }
}
