//! Query execution seam for tabular sources.
//!
//! This module provides:
//! - **QueryExecutor**: runs a [`Relation`] and returns ordered rows
//! - **InMemoryTable**: evaluates relations against rows held in memory

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::trace;

use super::relation::{Predicate, Relation, SortDirection, TableRow};
use crate::cursor::CursorValue;
use crate::error::{ErrorCode, IterationError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Query Executor Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs relations against a store.
///
/// Implementations must not memoize results: every call reflects current data.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Fetch the rows selected by `relation`, honouring its order and limit.
    async fn fetch(&self, relation: &Relation) -> Result<Vec<TableRow>>;

    /// Count the rows admitted by `relation`'s filters.
    async fn count(&self, relation: &Relation) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Table
// ═══════════════════════════════════════════════════════════════════════════════

/// A single table held in memory.
///
/// Rows sort with NULL and missing values last in ascending order, as PostgreSQL does.
pub struct InMemoryTable {
    name: String,
    primary_key: Vec<String>,
    rows: RwLock<Vec<TableRow>>,
    queries: AtomicU64,
}

impl InMemoryTable {
    /// Create an empty table keyed by `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: vec!["id".to_string()],
            rows: RwLock::new(Vec::new()),
            queries: AtomicU64::new(0),
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// A relation over every row of this table.
    pub fn relation(&self) -> Relation {
        Relation::new(self.name.clone()).primary_key(self.primary_key.clone())
    }

    pub fn insert(&self, row: TableRow) {
        self.rows.write().push(row);
    }

    /// Insert a JSON object as a row.
    pub fn insert_json(&self, value: Value) -> Result<()> {
        self.insert(TableRow::try_from(value)?);
        Ok(())
    }

    /// Remove every row matching `predicate`, returning how many were removed.
    pub fn delete_where(&self, predicate: &Predicate) -> usize {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| !predicate.matches(row));
        before - rows.len()
    }

    /// Set `column` on every row matching `predicate`.
    pub fn update_where(&self, predicate: &Predicate, column: &str, value: Value) -> usize {
        let mut rows = self.rows.write();
        let mut updated = 0;
        for row in rows.iter_mut().filter(|row| predicate.matches(row)) {
            row.set(column, value.clone());
            updated += 1;
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of fetch and count queries executed so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(AtomicOrdering::Relaxed)
    }

    fn check_table(&self, relation: &Relation) -> Result<()> {
        if relation.table_name() != self.name {
            return Err(IterationError::new(
                ErrorCode::DatabaseError,
                format!(
                    "relation targets table {:?} but this executor holds {:?}",
                    relation.table_name(),
                    self.name
                ),
            ));
        }
        Ok(())
    }
}

fn compare_nullable(a: Option<CursorValue>, b: Option<CursorValue>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.compare(&b).unwrap_or(Ordering::Equal),
    }
}

#[async_trait]
impl QueryExecutor for InMemoryTable {
    async fn fetch(&self, relation: &Relation) -> Result<Vec<TableRow>> {
        self.check_table(relation)?;
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);

        let mut rows: Vec<TableRow> = self
            .rows
            .read()
            .iter()
            .filter(|row| relation.admits(row))
            .cloned()
            .collect();

        let ordering = relation.ordering();
        if !ordering.is_empty() {
            rows.sort_by(|a, b| {
                ordering
                    .iter()
                    .map(|field| {
                        let ord = compare_nullable(
                            a.cursor_value(&field.name),
                            b.cursor_value(&field.name),
                        );
                        match field.direction {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        }
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        if let Some(limit) = relation.row_limit() {
            rows.truncate(limit as usize);
        }
        if let Some(columns) = relation.projection() {
            rows = rows.iter().map(|row| row.project(columns)).collect();
        }

        trace!(table = %self.name, rows = rows.len(), "In-memory fetch");
        Ok(rows)
    }

    async fn count(&self, relation: &Relation) -> Result<u64> {
        self.check_table(relation)?;
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| relation.admits(row))
            .count() as u64)
    }
}
