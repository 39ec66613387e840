//! In-memory sequences keyed by offset.

use async_trait::async_trait;
use std::any::TypeId;
use std::collections::VecDeque;

use super::tabular::{Relation, TableRow};
use super::Enumerator;
use crate::cursor::Cursor;
use crate::error::{ErrorCode, IterationError, Result};

/// Resume offset for a cursor holding the index of the last processed element.
fn start_offset(cursor: Option<&Cursor>) -> Result<u64> {
    match cursor.filter(|c| !c.is_null()) {
        Some(cursor) => Ok(cursor.as_index()? + 1),
        None => Ok(0),
    }
}

/// Yields the elements of a vector with their 0-based index as cursor.
#[derive(Debug)]
pub struct ArrayEnumerator<T> {
    items: VecDeque<T>,
    next_index: u64,
    total: u64,
}

impl<T: Send + 'static> ArrayEnumerator<T> {
    /// Wrap `items`, resuming after the index held by `cursor`.
    ///
    /// Rows and relations are rejected: iterate them through a tabular source so that
    /// checkpoints follow their keys rather than their position in a snapshot.
    pub fn new(items: Vec<T>, cursor: Option<Cursor>) -> Result<Self> {
        let item_type = TypeId::of::<T>();
        if item_type == TypeId::of::<TableRow>()
            || item_type == TypeId::of::<Vec<TableRow>>()
            || item_type == TypeId::of::<Relation>()
        {
            return Err(IterationError::configuration(
                ErrorCode::TabularItemInArray,
                "array enumerators cannot iterate table rows or relations; use a tabular enumerator",
            ));
        }

        let total = items.len() as u64;
        let start = start_offset(cursor.as_ref())?.min(total);
        let mut items = VecDeque::from(items);
        items.drain(..start as usize);

        Ok(Self {
            items,
            next_index: start,
            total,
        })
    }
}

#[async_trait]
impl<T: Send + 'static> Enumerator for ArrayEnumerator<T> {
    type Item = T;

    async fn next(&mut self) -> Result<Option<(T, Cursor)>> {
        Ok(self.items.pop_front().map(|item| {
            let cursor = Cursor::index(self.next_index);
            self.next_index += 1;
            (item, cursor)
        }))
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.total))
    }
}

/// Yields `0..count`, each number being its own cursor.
#[derive(Debug, Clone)]
pub struct RangeEnumerator {
    next: u64,
    count: u64,
}

impl RangeEnumerator {
    pub fn new(count: u64, cursor: Option<Cursor>) -> Result<Self> {
        Ok(Self {
            next: start_offset(cursor.as_ref())?,
            count,
        })
    }
}

#[async_trait]
impl Enumerator for RangeEnumerator {
    type Item = u64;

    async fn next(&mut self) -> Result<Option<(u64, Cursor)>> {
        if self.next >= self.count {
            return Ok(None);
        }
        let current = self.next;
        self.next += 1;
        Ok(Some((current, Cursor::index(current))))
    }

    async fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.count))
    }
}
